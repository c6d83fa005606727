//! Per-filter property collections.
//!
//! Filters define properties with a default value and description at
//! construction time; the configuration layer overrides them before the
//! lifecycle starts; filter code reads and writes them at run time from the
//! owning thread. Setting a property notifies subscribers synchronously on
//! the calling (owning) thread.

use crate::error::{PipeflowError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::String(_) => "string",
        }
    }

    /// Whether `other` has the same type as `self`. Ints are accepted where
    /// floats are expected.
    fn accepts(&self, other: &PropertyValue) -> bool {
        matches!(
            (self, other),
            (PropertyValue::Bool(_), PropertyValue::Bool(_))
                | (PropertyValue::Int(_), PropertyValue::Int(_))
                | (PropertyValue::Float(_), PropertyValue::Float(_))
                | (PropertyValue::Float(_), PropertyValue::Int(_))
                | (PropertyValue::String(_), PropertyValue::String(_))
        )
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}
impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}
impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}
impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}
impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

struct Property {
    value: PropertyValue,
    default: PropertyValue,
    #[allow(dead_code)]
    description: String,
}

type ChangeCallback = Box<dyn Fn(&str, &PropertyValue) + Send>;

#[derive(Default)]
struct Inner {
    properties: HashMap<String, Property>,
    /// Values provided by the configuration before the property was defined.
    pending_overrides: HashMap<String, PropertyValue>,
    subscribers: Vec<ChangeCallback>,
}

/// The property collection of a single filter.
///
/// Change notifications are dispatched synchronously to subscribers on the
/// thread that performed the `set_property` call, which for filter code is
/// always the owning thread.
#[derive(Default)]
pub struct PropertyCollection {
    inner: Mutex<Inner>,
}

impl PropertyCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a property with a default value and return its effective
    /// value. If the configuration supplied an override before the filter
    /// defined the property, the override wins (type-checked against the
    /// default). Re-defining an existing property returns its current value.
    pub fn define_property(
        &self,
        name: &str,
        default: impl Into<PropertyValue>,
        description: &str,
    ) -> Result<PropertyValue> {
        let default = default.into();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.properties.get(name) {
            return Ok(existing.value.clone());
        }
        let value = match inner.pending_overrides.remove(name) {
            Some(v) if default.accepts(&v) => v,
            Some(v) => {
                tracing::warn!(
                    "Ignoring configured value for property '{}': expected {}, got {}",
                    name,
                    default.type_name(),
                    v.type_name()
                );
                default.clone()
            }
            None => default.clone(),
        };
        inner.properties.insert(
            name.to_string(),
            Property {
                value: value.clone(),
                default,
                description: description.to_string(),
            },
        );
        Ok(value)
    }

    /// Get the current value of a property.
    pub fn get_property(&self, name: &str) -> Result<PropertyValue> {
        self.inner
            .lock()
            .properties
            .get(name)
            .map(|p| p.value.clone())
            .ok_or_else(|| PipeflowError::PropertyNotFound(name.to_string()))
    }

    /// Set a property to a new value. The value must match the type of the
    /// property's default. Subscribers are notified synchronously.
    pub fn set_property(&self, name: &str, value: impl Into<PropertyValue>) -> Result<()> {
        let value = value.into();
        {
            let mut inner = self.inner.lock();
            let prop = inner
                .properties
                .get_mut(name)
                .ok_or_else(|| PipeflowError::PropertyNotFound(name.to_string()))?;
            if !prop.default.accepts(&value) {
                return Err(PipeflowError::PropertyTypeMismatch {
                    name: name.to_string(),
                    expected: prop.default.type_name(),
                });
            }
            if prop.value == value {
                return Ok(());
            }
            prop.value = value.clone();
        }
        // notify outside the lock so subscribers may read other properties
        let inner = self.inner.lock();
        for cb in &inner.subscribers {
            cb(name, &value);
        }
        Ok(())
    }

    /// Register a change-notification callback.
    pub fn subscribe(&self, callback: impl Fn(&str, &PropertyValue) + Send + 'static) {
        self.inner.lock().subscribers.push(Box::new(callback));
    }

    /// Record a configured value to be applied when the filter defines the
    /// property. Used by the configuration layer before filter creation.
    pub fn set_override(&self, name: &str, value: PropertyValue) {
        self.inner
            .lock()
            .pending_overrides
            .insert(name.to_string(), value);
    }

    /// Names of all defined properties.
    pub fn property_names(&self) -> Vec<String> {
        self.inner.lock().properties.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_define_and_get() {
        let pc = PropertyCollection::new();
        let v = pc.define_property("rate", 100i64, "sampling rate").unwrap();
        assert_eq!(v, PropertyValue::Int(100));
        assert_eq!(pc.get_property("rate").unwrap(), PropertyValue::Int(100));
    }

    #[test]
    fn test_override_wins() {
        let pc = PropertyCollection::new();
        pc.set_override("rate", PropertyValue::Int(25));
        let v = pc.define_property("rate", 100i64, "sampling rate").unwrap();
        assert_eq!(v, PropertyValue::Int(25));
    }

    #[test]
    fn test_override_type_mismatch_falls_back_to_default() {
        let pc = PropertyCollection::new();
        pc.set_override("rate", PropertyValue::String("fast".into()));
        let v = pc.define_property("rate", 100i64, "sampling rate").unwrap();
        assert_eq!(v, PropertyValue::Int(100));
    }

    #[test]
    fn test_set_property_type_checked() {
        let pc = PropertyCollection::new();
        pc.define_property("gain", 1.5f64, "gain").unwrap();
        assert!(pc.set_property("gain", 2.0f64).is_ok());
        // ints are accepted where floats are expected
        assert!(pc.set_property("gain", 3i64).is_ok());
        assert!(matches!(
            pc.set_property("gain", "loud"),
            Err(PipeflowError::PropertyTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_property() {
        let pc = PropertyCollection::new();
        assert!(matches!(
            pc.get_property("nope"),
            Err(PipeflowError::PropertyNotFound(_))
        ));
    }

    #[test]
    fn test_change_notification() {
        let pc = PropertyCollection::new();
        pc.define_property("enabled", true, "toggle").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        pc.subscribe(move |name, value| {
            assert_eq!(name, "enabled");
            assert_eq!(value.as_bool(), Some(false));
            h.fetch_add(1, Ordering::SeqCst);
        });
        pc.set_property("enabled", false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // unchanged value does not notify
        pc.set_property("enabled", false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
