//! The graph document consumed by the runtime.
//!
//! A document lists one or more applications; each application names its
//! filters (library, factory, hosting thread, ports, properties) and the
//! connections between them. Documents are plain JSON:
//!
//! ```json
//! {
//!   "applications": [
//!     {
//!       "name": "blur",
//!       "nodes": [
//!         { "name": "camera", "library": "camera_plugin",
//!           "factoryFunction": "CameraGrabber", "thread": "grab" },
//!         { "name": "viewer", "library": "display_plugin",
//!           "factoryFunction": "ImageView",
//!           "properties": { "caption": "left", "scale": { "value": "$SCALE", "subst": true } } }
//!       ],
//!       "connections": [ "camera.video -2> viewer.video" ]
//!     }
//!   ]
//! }
//! ```
//!
//! A connection string is `from.port -> to.port`; the arrow may carry a
//! width, `-<width>>`, giving the number of transmit credits of a
//! cross-thread edge (`->` means width 1, `-0>` disables flow control).
//! Variable substitution of `{value, subst}` properties happens outside the
//! runtime; the raw string is carried through.

use crate::error::{PipeflowError, Result};
use crate::properties::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Thread filters are hosted on when the graph document does not name one.
pub const DEFAULT_THREAD: &str = "main";

/// Default number of transmit credits of a cross-thread edge.
pub const DEFAULT_CONNECTION_WIDTH: u32 = 1;

/// A complete graph document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
}

impl GraphConfig {
    /// Parse a document from its JSON text and validate it.
    pub fn from_str(text: &str) -> Result<Self> {
        let config: GraphConfig = serde_json::from_str(text)
            .map_err(|e| PipeflowError::Config(format!("invalid graph document: {}", e)))?;
        for app in &config.applications {
            app.validate()?;
        }
        Ok(config)
    }

    /// Load a document from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipeflowError::Config(format!(
                "cannot read graph document {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_str(&text)
    }

    /// Find an application by name.
    pub fn application(&self, name: &str) -> Result<&ApplicationConfig> {
        self.applications
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| PipeflowError::Config(format!("application '{}' not found", name)))
    }
}

/// One runnable filter graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub connections: Vec<String>,
}

impl ApplicationConfig {
    /// Check identifiers, node references and connection syntax.
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.name)?;
        let mut names = std::collections::HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !names.insert(node.name.as_str()) {
                return Err(PipeflowError::Config(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }
        for spec in self.parsed_connections()? {
            if !names.contains(spec.from_filter.as_str()) {
                return Err(PipeflowError::Config(format!(
                    "connection references unknown node '{}'",
                    spec.from_filter
                )));
            }
            if !names.contains(spec.to_filter.as_str()) {
                return Err(PipeflowError::Config(format!(
                    "connection references unknown node '{}'",
                    spec.to_filter
                )));
            }
        }
        Ok(())
    }

    /// Parse every connection string of this application.
    pub fn parsed_connections(&self) -> Result<Vec<ConnectionConfig>> {
        self.connections.iter().map(|s| parse_connection(s)).collect()
    }
}

/// One filter instance in a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    pub name: String,
    pub library: String,
    pub factory_function: String,
    #[serde(default = "default_thread")]
    pub thread: String,
    #[serde(default)]
    pub static_input_ports: Vec<String>,
    #[serde(default)]
    pub static_output_ports: Vec<String>,
    #[serde(default)]
    pub dynamic_input_ports: Vec<PortConfig>,
    #[serde(default)]
    pub dynamic_output_ports: Vec<PortConfig>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyEntry>,
}

fn default_thread() -> String {
    DEFAULT_THREAD.to_string()
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        check_identifier(&self.name)?;
        check_identifier(&self.thread)?;
        for port in self
            .static_input_ports
            .iter()
            .chain(self.static_output_ports.iter())
        {
            check_identifier(port)?;
        }
        for port in self
            .dynamic_input_ports
            .iter()
            .chain(self.dynamic_output_ports.iter())
        {
            check_identifier(&port.name)?;
        }
        Ok(())
    }
}

/// Parameters of a config-created (dynamic) port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    pub name: String,
    #[serde(default = "default_queue_size_samples")]
    pub queue_size_samples: i64,
    #[serde(default = "default_queue_size_seconds")]
    pub queue_size_seconds: f64,
    #[serde(default)]
    pub interthread_dynamic_queue: bool,
}

fn default_queue_size_samples() -> i64 {
    1
}

fn default_queue_size_seconds() -> f64 {
    -1.0
}

/// A property value in the graph document: either a literal or a
/// `{value, subst}` envelope whose substitution happens outside the
/// runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyEntry {
    Subst { value: String, subst: bool },
    Literal(serde_json::Value),
}

impl PropertyEntry {
    /// Convert to a runtime property value. Unsupported JSON shapes
    /// (arrays, objects, null) are rejected.
    pub fn to_property_value(&self) -> Result<PropertyValue> {
        match self {
            PropertyEntry::Subst { value, .. } => Ok(PropertyValue::String(value.clone())),
            PropertyEntry::Literal(value) => match value {
                serde_json::Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(PropertyValue::Int(i))
                    } else if let Some(f) = n.as_f64() {
                        Ok(PropertyValue::Float(f))
                    } else {
                        Err(PipeflowError::Config(format!(
                            "unsupported numeric property value {}",
                            n
                        )))
                    }
                }
                serde_json::Value::String(s) => Ok(PropertyValue::String(s.clone())),
                other => Err(PipeflowError::Config(format!(
                    "unsupported property value {}",
                    other
                ))),
            },
        }
    }
}

/// A parsed connection: one edge from an output port to an input port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub from_filter: String,
    pub from_port: String,
    pub to_filter: String,
    pub to_port: String,
    /// Transmit credits of a cross-thread edge; 0 disables flow control.
    pub width: u32,
}

/// Parse `from.port -> to.port` with an optional `-<width>>` arrow.
pub fn parse_connection(text: &str) -> Result<ConnectionConfig> {
    let bad = |reason: &str| {
        PipeflowError::Config(format!("invalid connection '{}': {}", text, reason))
    };
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let [from, arrow, to] = tokens.as_slice() else {
        return Err(bad("expected 'from.port -> to.port'"));
    };
    let width = if *arrow == "->" {
        DEFAULT_CONNECTION_WIDTH
    } else {
        let digits = arrow
            .strip_prefix('-')
            .and_then(|a| a.strip_suffix('>'))
            .ok_or_else(|| bad("malformed arrow"))?;
        digits
            .parse::<u32>()
            .map_err(|_| bad("malformed width suffix"))?
    };
    let (from_filter, from_port) = split_endpoint(from).ok_or_else(|| bad("malformed source"))?;
    let (to_filter, to_port) = split_endpoint(to).ok_or_else(|| bad("malformed target"))?;
    for part in [from_filter, from_port, to_filter, to_port] {
        check_identifier(part)?;
    }
    Ok(ConnectionConfig {
        from_filter: from_filter.to_string(),
        from_port: from_port.to_string(),
        to_filter: to_filter.to_string(),
        to_port: to_port.to_string(),
        width,
    })
}

fn split_endpoint(text: &str) -> Option<(&str, &str)> {
    let mut parts = text.split('.');
    let filter = parts.next()?;
    let port = parts.next()?;
    if parts.next().is_some() || filter.is_empty() || port.is_empty() {
        return None;
    }
    Some((filter, port))
}

/// Validate an identifier against `^[A-Za-z_][A-Za-z0-9_-]*$`.
pub fn check_identifier(text: &str) -> Result<()> {
    let valid = text
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && text
            .chars()
            .skip(1)
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PipeflowError::Config(format!(
            "'{}' is not a valid identifier",
            text
        )))
    }
}
