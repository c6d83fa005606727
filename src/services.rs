//! Process-wide service registry and the optional Logging/Profiling
//! service traits.
//!
//! Services are opaque objects registered by name. The runtime core only
//! interprets two entries, both optional: `"Logging"` (a leveled sink) and
//! `"Profiling"` (callback timing hooks around data delivery). Everything
//! else is pass-through for applications.
//!
//! Initialize the registry before constructing any filter and tear it down
//! after the lifecycle has returned to `Destructed`.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Shared handle to a registered service object.
pub type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Log levels understood by the [`Logging`] service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A leveled logging sink.
pub trait Logging: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Default logging sink forwarding to the `tracing` macros.
#[derive(Debug, Default)]
pub struct TracingLogger;

impl Logging for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }
}

/// Timing hooks bracketing filter work, consulted by input ports and worker
/// threads when a `"Profiling"` service is registered.
pub trait Profiling: Send + Sync {
    /// A worker thread started hosting filters.
    fn register_thread(&self) {}

    /// A worker thread stopped hosting filters.
    fn deregister_thread(&self) {}

    /// Called on the consuming thread right before `on_port_data_changed`.
    fn before_port_data_changed(&self, port: &str);

    /// Called on the consuming thread right after `on_port_data_changed`.
    fn after_port_data_changed(&self, port: &str);
}

fn registry() -> &'static RwLock<HashMap<String, ServiceObject>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, ServiceObject>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// The process-wide name→object service registry.
pub struct Services;

impl Services {
    /// Register (or replace) a service under `name`.
    pub fn register(name: &str, service: ServiceObject) {
        registry().write().insert(name.to_string(), service);
    }

    /// Look up a service by name.
    pub fn get(name: &str) -> Option<ServiceObject> {
        registry().read().get(name).cloned()
    }

    /// Look up the `"Profiling"` service, if one is registered with the
    /// right type.
    pub fn profiling() -> Option<Arc<dyn Profiling>> {
        Services::get("Profiling")?.downcast::<ProfilingService>().ok().map(|s| s.0.clone())
    }

    /// Look up the `"Logging"` service, if one is registered with the right
    /// type.
    pub fn logging() -> Option<Arc<dyn Logging>> {
        Services::get("Logging")?.downcast::<LoggingService>().ok().map(|s| s.0.clone())
    }

    /// Register a profiling implementation under `"Profiling"`.
    pub fn register_profiling(service: Arc<dyn Profiling>) {
        Services::register("Profiling", Arc::new(ProfilingService(service)));
    }

    /// Register a logging sink under `"Logging"`.
    pub fn register_logging(service: Arc<dyn Logging>) {
        Services::register("Logging", Arc::new(LoggingService(service)));
    }

    /// Remove a single service.
    pub fn remove(name: &str) -> Option<ServiceObject> {
        registry().write().remove(name)
    }

    /// Drop every registered service. Call after the lifecycle has returned
    /// to `Destructed`.
    pub fn teardown() {
        registry().write().clear();
    }
}

// `dyn Profiling`/`dyn Logging` cannot be downcast directly from `dyn Any`,
// so the registry stores them behind these concrete wrappers.
struct ProfilingService(Arc<dyn Profiling>);
struct LoggingService(Arc<dyn Logging>);
