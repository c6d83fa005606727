//! The registration surface for filter implementations.
//!
//! A plugin module exposes a mapping from factory names to factory
//! functions; the runtime looks factories up by the `factoryFunction` field
//! of a graph node and calls them on the filter's owning thread. How the
//! module itself is discovered (native library, script, static link) is
//! outside the runtime core — anything that can hand over factories works.

use crate::environment::FilterEnvironment;
use crate::error::{PipeflowError, Result};
use crate::filter::Filter;
use std::collections::HashMap;
use std::sync::Arc;

/// A factory producing a filter instance for a given environment. Invoked
/// on the filter's owning thread; the factory typically creates the
/// filter's static ports and registers them on `env`.
pub type FilterFactory =
    Arc<dyn Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync>;

/// Name → factory registry consulted when a graph is instantiated.
#[derive(Default)]
pub struct PluginRegistry {
    factories: HashMap<String, FilterFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous entry.
    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&Arc<FilterEnvironment>) -> Result<Box<dyn Filter>> + Send + Sync + 'static,
    ) {
        if self
            .factories
            .insert(name.to_string(), Arc::new(factory))
            .is_some()
        {
            tracing::warn!("plugin factory '{}' was replaced", name);
        }
    }

    /// Ingest a module's complete name → factory mapping.
    pub fn register_module(&mut self, entries: impl IntoIterator<Item = (String, FilterFactory)>) {
        for (name, factory) in entries {
            if self.factories.insert(name.clone(), factory).is_some() {
                tracing::warn!("plugin factory '{}' was replaced", name);
            }
        }
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Result<FilterFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| PipeflowError::Config(format!("unknown filter factory '{}'", name)))
    }

    /// Registered factory names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}
