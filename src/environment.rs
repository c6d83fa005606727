//! The per-filter container: filter instance, port set, property
//! collection, owning thread and lifecycle state.
//!
//! Exactly one `FilterEnvironment` exists per filter instance. It is
//! created on the filter's owning thread; the recorded thread id backs
//! every thread assertion made by the filter's ports. The lifecycle
//! controller advances the state machine through `pre_transition` /
//! `perform`; data delivery funnels through `port_data_changed`, which
//! enforces the state gate and contains filter errors.

use crate::error::{PipeflowError, Result};
use crate::executor::Executor;
use crate::filter::{Filter, FilterState};
use crate::ports::{InputPort, OutputPort, Port, PortDirection};
use crate::properties::PropertyCollection;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// A lifecycle operation driven by the controller. `Create` and `Destruct`
/// are handled separately by the worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Init,
    Open,
    Start,
    Stop,
    Close,
    Deinit,
}

impl Operation {
    /// `(from, transitional, to)` states of this operation.
    pub(crate) fn states(self) -> (FilterState, FilterState, FilterState) {
        match self {
            Operation::Init => (
                FilterState::Constructed,
                FilterState::Initializing,
                FilterState::Initialized,
            ),
            Operation::Open => (
                FilterState::Initialized,
                FilterState::Opening,
                FilterState::Opened,
            ),
            Operation::Start => (
                FilterState::Opened,
                FilterState::Starting,
                FilterState::Active,
            ),
            Operation::Stop => (
                FilterState::Active,
                FilterState::Stopping,
                FilterState::Opened,
            ),
            Operation::Close => (
                FilterState::Opened,
                FilterState::Closing,
                FilterState::Initialized,
            ),
            Operation::Deinit => (
                FilterState::Initialized,
                FilterState::Deinitializing,
                FilterState::Constructed,
            ),
        }
    }

    /// Forward operations abort on callback failure; reverse operations log
    /// and complete.
    pub(crate) fn is_forward(self) -> bool {
        matches!(self, Operation::Init | Operation::Open | Operation::Start)
    }

    pub(crate) fn callback_name(self) -> &'static str {
        match self {
            Operation::Init => "on_init",
            Operation::Open => "on_open",
            Operation::Start => "on_start",
            Operation::Stop => "on_stop",
            Operation::Close => "on_close",
            Operation::Deinit => "on_deinit",
        }
    }
}

static NEXT_ENV_ID: AtomicUsize = AtomicUsize::new(1);

/// Per-filter runtime container. See the module documentation.
pub struct FilterEnvironment {
    name: String,
    thread_name: String,
    id: usize,
    thread_id: ThreadId,
    executor: Arc<Executor>,
    properties: Arc<PropertyCollection>,
    filter: Mutex<Option<Box<dyn Filter>>>,
    ports: Mutex<Vec<Port>>,
    state: Mutex<FilterState>,
    dynamic_input_supported: AtomicBool,
    dynamic_output_supported: AtomicBool,
}

impl FilterEnvironment {
    /// Create an environment on the current thread, which becomes the
    /// filter's owning thread.
    pub fn new(
        name: &str,
        thread_name: &str,
        executor: Arc<Executor>,
        properties: Arc<PropertyCollection>,
    ) -> Arc<Self> {
        Arc::new(FilterEnvironment {
            name: name.to_string(),
            thread_name: thread_name.to_string(),
            id: NEXT_ENV_ID.fetch_add(1, Ordering::Relaxed),
            thread_id: std::thread::current().id(),
            executor,
            properties,
            filter: Mutex::new(None),
            ports: Mutex::new(Vec::new()),
            state: Mutex::new(FilterState::Constructing),
            dynamic_input_supported: AtomicBool::new(false),
            dynamic_output_supported: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Unique identity of this environment, used by the executor's
    /// blocked-filter set.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn property_collection(&self) -> &Arc<PropertyCollection> {
        &self.properties
    }

    pub fn state(&self) -> FilterState {
        *self.state.lock()
    }

    /// Declare whether this filter accepts dynamic (config-created) ports.
    /// Called by the filter's constructor.
    pub fn set_dynamic_ports_supported(&self, input: bool, output: bool) {
        self.dynamic_input_supported.store(input, Ordering::Relaxed);
        self.dynamic_output_supported.store(output, Ordering::Relaxed);
    }

    pub fn dynamic_ports_supported(&self) -> (bool, bool) {
        (
            self.dynamic_input_supported.load(Ordering::Relaxed),
            self.dynamic_output_supported.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_filter(&self, filter: Box<dyn Filter>) {
        *self.filter.lock() = Some(filter);
    }

    /// Register a port. Only legal while the state machine still allows
    /// port changes (Constructing..Initialized).
    pub fn add_port(&self, port: Port) -> Result<()> {
        let state = self.state();
        if !state.allows_port_changes() {
            return Err(PipeflowError::StateMachine {
                from: state,
                to: state,
            });
        }
        if port.dynamic() {
            let (dyn_in, dyn_out) = self.dynamic_ports_supported();
            match port.direction() {
                PortDirection::Input if !dyn_in => {
                    return Err(PipeflowError::DynamicPortsUnsupported("input"))
                }
                PortDirection::Output if !dyn_out => {
                    return Err(PipeflowError::DynamicPortsUnsupported("output"))
                }
                _ => {}
            }
        }
        let mut ports = self.ports.lock();
        if ports
            .iter()
            .any(|p| p.direction() == port.direction() && p.name() == port.name())
        {
            return Err(PipeflowError::PortExists(port.name()));
        }
        ports.push(port);
        Ok(())
    }

    /// Unregister a port by name and direction.
    pub fn remove_port(&self, name: &str, direction: PortDirection) -> Result<()> {
        let state = self.state();
        if !state.allows_port_changes() {
            return Err(PipeflowError::StateMachine {
                from: state,
                to: state,
            });
        }
        let mut ports = self.ports.lock();
        let before = ports.len();
        ports.retain(|p| !(p.direction() == direction && p.name() == name));
        if ports.len() == before {
            return Err(PipeflowError::PortNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn get_input_port(&self, name: &str) -> Result<InputPort> {
        self.ports
            .lock()
            .iter()
            .filter_map(|p| p.as_input())
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| PipeflowError::PortNotFound(name.to_string()))
    }

    pub fn get_output_port(&self, name: &str) -> Result<OutputPort> {
        self.ports
            .lock()
            .iter()
            .filter_map(|p| p.as_output())
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| PipeflowError::PortNotFound(name.to_string()))
    }

    pub fn input_ports(&self) -> Vec<InputPort> {
        self.ports
            .lock()
            .iter()
            .filter_map(|p| p.as_input())
            .cloned()
            .collect()
    }

    pub fn output_ports(&self) -> Vec<OutputPort> {
        self.ports
            .lock()
            .iter()
            .filter_map(|p| p.as_output())
            .cloned()
            .collect()
    }

    pub fn dynamic_input_ports(&self) -> Vec<InputPort> {
        self.input_ports().into_iter().filter(|p| p.dynamic()).collect()
    }

    pub fn dynamic_output_ports(&self) -> Vec<OutputPort> {
        self.output_ports().into_iter().filter(|p| p.dynamic()).collect()
    }

    /// Factory succeeded: Constructing -> Constructed.
    pub(crate) fn mark_constructed(&self) {
        *self.state.lock() = FilterState::Constructed;
    }

    /// Enter the transitional state of `op` before any callback of the
    /// operation runs anywhere in the graph.
    ///
    /// A reverse operation on a filter that never reached the operation's
    /// source state (because an earlier forward transition failed) is
    /// skipped silently; `perform` will observe the unchanged state and
    /// skip too. A forward mismatch is an error.
    pub(crate) fn pre_transition(&self, op: Operation) -> Result<()> {
        let (from, transitional, _) = op.states();
        let mut state = self.state.lock();
        if *state == from {
            *state = transitional;
            return Ok(());
        }
        if op.is_forward() {
            return Err(PipeflowError::StateMachine {
                from: *state,
                to: transitional,
            });
        }
        tracing::debug!(
            "filter '{}' skips {} (state {}, expected {})",
            self.name,
            op.callback_name(),
            *state,
            from
        );
        Ok(())
    }

    /// Run the callback of `op` and complete the transition.
    ///
    /// Forward operations revert to the source state when the callback
    /// fails and report the failure; reverse operations log the failure
    /// and complete anyway, so teardown always makes progress.
    pub(crate) fn perform(&self, op: Operation) -> Result<()> {
        let (from, transitional, to) = op.states();
        {
            let state = self.state.lock();
            if *state != transitional {
                // pre_transition skipped this filter
                return Ok(());
            }
        }
        let result = {
            let mut filter = self.filter.lock();
            match filter.as_mut() {
                Some(filter) => match op {
                    Operation::Init => filter.on_init(),
                    Operation::Open => filter.on_open(),
                    Operation::Start => filter.on_start(),
                    Operation::Stop => filter.on_stop(),
                    Operation::Close => filter.on_close(),
                    Operation::Deinit => filter.on_deinit(),
                },
                None => Err(PipeflowError::Internal(format!(
                    "filter '{}' has no instance",
                    self.name
                ))),
            }
        };
        match result {
            Ok(()) => {
                *self.state.lock() = to;
                Ok(())
            }
            Err(e) if op.is_forward() => {
                *self.state.lock() = from;
                Err(PipeflowError::plugin(self.name.as_str(), op.callback_name(), e))
            }
            Err(e) => {
                tracing::error!(
                    "Error in {} of filter '{}' (continuing teardown): {}",
                    op.callback_name(),
                    self.name,
                    e
                );
                *self.state.lock() = to;
                Ok(())
            }
        }
    }

    /// Drop the filter instance: Constructed -> Destructing -> Destructed.
    pub(crate) fn destruct(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, FilterState::Constructed | FilterState::Destructing) {
                tracing::error!(
                    "Destructing filter '{}' from unexpected state {}",
                    self.name,
                    *state
                );
            }
            *state = FilterState::Destructing;
        }
        self.filter.lock().take();
        self.ports.lock().clear();
        *self.state.lock() = FilterState::Destructed;
    }

    /// Deliver a sample notification to the filter.
    ///
    /// Only legal in `Active`; a sample arriving in `Opened` is dropped
    /// with a warning (the graph has already stopped), anything else is an
    /// invariant violation. Filter errors are contained here: logged with
    /// the filter name, and the pipeline continues.
    pub(crate) fn port_data_changed(&self, port: &InputPort) {
        match self.state() {
            FilterState::Active => {}
            FilterState::Opened => {
                tracing::warn!(
                    "Sample on port '{}' discarded: filter '{}' has already been stopped.",
                    port.name(),
                    self.name
                );
                return;
            }
            state => {
                tracing::error!(
                    "Invariant violation: sample on port '{}' while filter '{}' is in state {}.",
                    port.name(),
                    self.name,
                    state
                );
                return;
            }
        }
        // while the callback runs, further events for this filter stay
        // queued (the executor skips blocked filters in queue order)
        let _scope = self.executor.block_scope(self.id);
        let mut filter = self.filter.lock();
        let Some(filter) = filter.as_mut() else {
            tracing::error!("Filter '{}' has no instance; sample discarded.", self.name);
            return;
        };
        if let Err(e) = filter.on_port_data_changed(port) {
            tracing::error!(
                "Unhandled error in on_port_data_changed of filter '{}': {}",
                self.name,
                e
            );
        }
    }

    /// Run `f` with exclusive access to the filter instance. Must be called
    /// from the owning thread.
    pub fn with_filter<R>(&self, f: impl FnOnce(&mut dyn Filter) -> R) -> Result<R> {
        if std::thread::current().id() != self.thread_id {
            return Err(PipeflowError::WrongThread("FilterEnvironment::with_filter"));
        }
        let mut filter = self.filter.lock();
        match filter.as_mut() {
            Some(filter) => Ok(f(filter.as_mut())),
            None => Err(PipeflowError::FilterNotFound(self.name.clone())),
        }
    }
}
