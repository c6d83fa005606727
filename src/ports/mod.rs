//! Ports: the named endpoints through which filters exchange samples.
//!
//! A port is either an input or an output; both are cheap clone-able
//! handles that filters keep in their own structs. Every port belongs to
//! exactly one [`FilterEnvironment`](crate::environment::FilterEnvironment)
//! and inherits that filter's owning thread — emission and reception assert
//! the calling thread.

pub mod connection;
mod input;

pub use connection::{
    setup_direct_connection, setup_inter_thread_connection, InterThreadConnection,
};
pub use input::InputPort;

use crate::environment::FilterEnvironment;
use crate::error::{PipeflowError, Result};
use crate::executor::Executor;
use crate::sample::SharedDataSample;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Whether a port is an input or an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// State common to input and output ports.
pub(crate) struct PortBase {
    dynamic: bool,
    name: String,
    env: Weak<FilterEnvironment>,
}

impl PortBase {
    pub(crate) fn new(dynamic: bool, name: &str, env: &Arc<FilterEnvironment>) -> Self {
        PortBase {
            dynamic,
            name: name.to_string(),
            env: Arc::downgrade(env),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dynamic(&self) -> bool {
        self.dynamic
    }

    pub(crate) fn environment(&self) -> Result<Arc<FilterEnvironment>> {
        self.env.upgrade().ok_or_else(|| {
            PipeflowError::Internal(format!(
                "port '{}' is detached from its filter environment",
                self.name
            ))
        })
    }

    /// Resolve the environment and fail unless the current thread is the
    /// filter's owning thread.
    pub(crate) fn assert_owning_thread(
        &self,
        context: &'static str,
    ) -> Result<Arc<FilterEnvironment>> {
        let env = self.environment()?;
        if std::thread::current().id() != env.thread_id() {
            return Err(PipeflowError::WrongThread(context));
        }
        Ok(env)
    }
}

/// A directional port handle, as stored in a filter environment's port set.
#[derive(Clone)]
pub enum Port {
    Input(InputPort),
    Output(OutputPort),
}

impl Port {
    pub fn name(&self) -> String {
        match self {
            Port::Input(p) => p.name(),
            Port::Output(p) => p.name(),
        }
    }

    pub fn dynamic(&self) -> bool {
        match self {
            Port::Input(p) => p.dynamic(),
            Port::Output(p) => p.dynamic(),
        }
    }

    pub fn direction(&self) -> PortDirection {
        match self {
            Port::Input(_) => PortDirection::Input,
            Port::Output(_) => PortDirection::Output,
        }
    }

    pub fn as_input(&self) -> Option<&InputPort> {
        match self {
            Port::Input(p) => Some(p),
            Port::Output(_) => None,
        }
    }

    pub fn as_output(&self) -> Option<&OutputPort> {
        match self {
            Port::Output(p) => Some(p),
            Port::Input(_) => None,
        }
    }
}

/// A transport edge attached to an output port.
#[derive(Clone)]
pub(crate) enum ConnectionTarget {
    /// Consumer lives on the same thread: enqueue a sync receive event on
    /// the shared executor.
    Direct {
        executor: Arc<Executor>,
        input: InputPort,
    },
    /// Consumer lives on another thread: hand the sample to the
    /// credit-bounded connection.
    InterThread(Arc<InterThreadConnection>),
}

struct OutputPortInner {
    base: PortBase,
    targets: Mutex<Vec<ConnectionTarget>>,
}

/// An output port. Holds no queue; [`OutputPort::transmit`] publishes a
/// sample synchronously to every attached connection.
#[derive(Clone)]
pub struct OutputPort {
    inner: Arc<OutputPortInner>,
}

impl OutputPort {
    /// Create an output port on `env`. The port is not registered; call
    /// [`FilterEnvironment::add_port`](crate::environment::FilterEnvironment::add_port)
    /// with the returned handle.
    pub fn new(dynamic: bool, name: &str, env: &Arc<FilterEnvironment>) -> Self {
        OutputPort {
            inner: Arc::new(OutputPortInner {
                base: PortBase::new(dynamic, name, env),
                targets: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.base.name().to_string()
    }

    pub fn dynamic(&self) -> bool {
        self.inner.base.dynamic()
    }

    /// Publish a sample to every outgoing connection. Must be called from
    /// the filter's owning thread.
    pub fn transmit(&self, sample: &SharedDataSample) -> Result<()> {
        self.inner.base.assert_owning_thread("OutputPort::transmit")?;
        // snapshot so a cooperative pump inside an inter-thread send cannot
        // observe the targets lock held
        let targets: Vec<ConnectionTarget> = self.inner.targets.lock().clone();
        for target in targets {
            match target {
                ConnectionTarget::Direct { executor, input } => {
                    executor.register_pending_rcv_sync(&input, sample);
                }
                ConnectionTarget::InterThread(conn) => {
                    conn.receive_sample(sample);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn environment(&self) -> Result<Arc<FilterEnvironment>> {
        self.inner.base.environment()
    }

    pub(crate) fn add_target(&self, target: ConnectionTarget) {
        self.inner.targets.lock().push(target);
    }

    /// Detach all connections; called when the graph is torn down.
    pub(crate) fn clear_connections(&self) {
        self.inner.targets.lock().clear();
    }

    /// Number of attached connections.
    pub fn connection_count(&self) -> usize {
        self.inner.targets.lock().len()
    }
}
