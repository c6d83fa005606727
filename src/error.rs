//! Error handling for pipeflow
//!
//! This module defines the crate-wide error type and a Result alias.
//! Each variant corresponds to one failure class of the runtime; see the
//! individual variant documentation for the recovery policy.

use crate::filter::FilterState;
use thiserror::Error;

/// Main error type for pipeflow operations
#[derive(Error, Debug)]
pub enum PipeflowError {
    /// An operation was invoked from a thread other than its owning thread.
    /// Fatal to the calling operation.
    #[error("{0} has been called from an unexpected thread")]
    WrongThread(&'static str),

    /// A queue lookup (`InputPort::get_data`) referenced a sample that is
    /// not retained.
    #[error("queue access out of range: {0}")]
    OutOfRange(String),

    /// A lifecycle operation was requested in an incompatible state.
    #[error("illegal state transition: {from} -> {to}")]
    StateMachine {
        from: FilterState,
        to: FilterState,
    },

    /// A send was attempted on a stopped connection. The sample is dropped;
    /// callers treat this as a warning and proceed.
    #[error("the inter-thread connection is stopped; data sample discarded")]
    TransportStopped,

    /// User-supplied filter code (factory or callback) failed.
    #[error("filter '{filter}' failed in {operation}: {message}")]
    Plugin {
        filter: String,
        operation: &'static str,
        message: String,
    },

    /// Errors in the graph document or connection strings.
    #[error("configuration error: {0}")]
    Config(String),

    /// A port with the same name and direction already exists.
    #[error("port '{0}' already exists")]
    PortExists(String),

    /// Port lookup by name failed.
    #[error("port '{0}' not found")]
    PortNotFound(String),

    /// Filter lookup by name failed.
    #[error("filter '{0}' not found")]
    FilterNotFound(String),

    /// Thread lookup by name failed.
    #[error("thread '{0}' not found")]
    ThreadNotFound(String),

    /// A dynamic port was added to a filter that does not support them.
    #[error("filter does not support dynamic {0} ports")]
    DynamicPortsUnsupported(&'static str),

    /// Property lookup failed.
    #[error("property '{0}' is not defined")]
    PropertyNotFound(String),

    /// A property was set to a value of a different type than its default.
    #[error("property '{name}' expects a {expected} value")]
    PropertyTypeMismatch {
        name: String,
        expected: &'static str,
    },

    /// Internal invariant violation; logged, never used for control flow.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipeflowError {
    /// Build a `Plugin` error from a filter name, operation and source error.
    pub fn plugin(
        filter: impl Into<String>,
        operation: &'static str,
        source: impl std::fmt::Display,
    ) -> Self {
        PipeflowError::Plugin {
            filter: filter.into(),
            operation,
            message: source.to_string(),
        }
    }
}

/// Result type alias for pipeflow operations
pub type Result<T> = std::result::Result<T, PipeflowError>;
