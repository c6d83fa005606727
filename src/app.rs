//! The active application: global lifecycle sequencing over a filter graph.
//!
//! `ActiveApplication` owns the thread pool and drives every filter through
//! the lifecycle in lock step: a transition completes on all threads before
//! the next one starts. Connections are materialized when the graph opens
//! and torn down when it closes; starting and stopping flips the stop flag
//! of every inter-thread edge, and stopping drains in-flight samples.
//!
//! Forward failures unwind: if a filter fails `on_init`/`on_open`/
//! `on_start`, the operation reports the error and [`ActiveApplication::shutdown`]
//! runs the inverse sequence from whatever states the filters actually
//! reached — a filter that never completed `on_open` is not asked to run
//! `on_close`.

use crate::config::{ApplicationConfig, ConnectionConfig};
use crate::environment::{FilterEnvironment, Operation};
use crate::error::{PipeflowError, Result};
use crate::filter::FilterState;
use crate::plugin::PluginRegistry;
use crate::ports::{
    setup_direct_connection, setup_inter_thread_connection, InterThreadConnection,
};
use crate::properties::PropertyCollection;
use crate::thread::{DynamicPortSpec, FilterRecipe, ThreadOperation, ThreadPool};
use std::collections::HashMap;
use std::sync::Arc;

/// A running (instantiated) filter graph and its lifecycle state machine.
pub struct ActiveApplication {
    name: String,
    pool: ThreadPool,
    filters: HashMap<String, Arc<FilterEnvironment>>,
    connection_specs: Vec<ConnectionConfig>,
    inter_thread_connections: Vec<Arc<InterThreadConnection>>,
    state: FilterState,
    graph_connected: bool,
}

impl ActiveApplication {
    /// Instantiate the application: spawn its threads and create every
    /// filter on its owning thread. On success the graph is in
    /// `Constructed`.
    pub fn new(config: &ApplicationConfig, registry: &PluginRegistry) -> Result<Self> {
        config.validate()?;
        let connection_specs = config.parsed_connections()?;

        let mut pool = ThreadPool::new();
        for node in &config.nodes {
            let factory = registry.get(&node.factory_function).map_err(|e| {
                PipeflowError::Config(format!(
                    "node '{}' (library '{}'): {}",
                    node.name, node.library, e
                ))
            })?;
            let properties = Arc::new(PropertyCollection::new());
            for (key, entry) in &node.properties {
                properties.set_override(key, entry.to_property_value()?);
            }
            let recipe = FilterRecipe {
                name: node.name.clone(),
                factory,
                properties,
                dynamic_input_ports: node
                    .dynamic_input_ports
                    .iter()
                    .map(|p| DynamicPortSpec {
                        name: p.name.clone(),
                        queue_size_samples: p.queue_size_samples,
                        queue_size_seconds: p.queue_size_seconds,
                        interthread_dynamic_queue: p.interthread_dynamic_queue,
                    })
                    .collect(),
                dynamic_output_ports: node
                    .dynamic_output_ports
                    .iter()
                    .map(|p| DynamicPortSpec {
                        name: p.name.clone(),
                        queue_size_samples: p.queue_size_samples,
                        queue_size_seconds: p.queue_size_seconds,
                        interthread_dynamic_queue: p.interthread_dynamic_queue,
                    })
                    .collect(),
            };
            pool.get_or_spawn(&node.thread)?.add_recipe(recipe);
        }

        tracing::info!(
            "creating application '{}' ({} nodes, {} threads)",
            config.name,
            config.nodes.len(),
            pool.threads().len()
        );
        if let Err(e) = pool.broadcast(ThreadOperation::Create) {
            // throw away whatever was created and report the failure
            let _ = pool.broadcast(ThreadOperation::Destruct);
            pool.shutdown();
            return Err(e);
        }

        let mut filters = HashMap::new();
        for worker in pool.threads() {
            for env in worker.filters() {
                filters.insert(env.name().to_string(), env);
            }
        }

        let app = ActiveApplication {
            name: config.name.clone(),
            pool,
            filters,
            connection_specs,
            inter_thread_connections: Vec::new(),
            state: FilterState::Constructed,
            graph_connected: false,
        };
        app.validate_static_ports(config);
        Ok(app)
    }

    /// Warn about mismatches between the graph document's static port lists
    /// and the ports the filters actually created.
    fn validate_static_ports(&self, config: &ApplicationConfig) {
        for node in &config.nodes {
            let Some(env) = self.filters.get(&node.name) else {
                continue;
            };
            for name in &node.static_input_ports {
                if env.get_input_port(name).is_err() {
                    tracing::warn!(
                        "node '{}' declares static input port '{}' but the filter did not create it",
                        node.name,
                        name
                    );
                }
            }
            for name in &node.static_output_ports {
                if env.get_output_port(name).is_err() {
                    tracing::warn!(
                        "node '{}' declares static output port '{}' but the filter did not create it",
                        node.name,
                        name
                    );
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current application-level lifecycle state.
    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Look up a filter environment by node name.
    pub fn get_filter(&self, name: &str) -> Result<Arc<FilterEnvironment>> {
        self.filters
            .get(name)
            .cloned()
            .ok_or_else(|| PipeflowError::FilterNotFound(name.to_string()))
    }

    /// Names of all instantiated filters.
    pub fn filter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.keys().cloned().collect();
        names.sort();
        names
    }

    /// The inter-thread connections of the opened graph.
    pub fn connections(&self) -> &[Arc<InterThreadConnection>] {
        &self.inter_thread_connections
    }

    /// Queue a closure on a named worker thread's event loop. Use this to
    /// invoke filter code (e.g. drive a source) on its owning thread.
    pub fn post_to_thread(&self, thread: &str, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.pool
            .get(thread)
            .ok_or_else(|| PipeflowError::ThreadNotFound(thread.to_string()))?
            .post(task)
    }

    fn lifecycle(&mut self, op: Operation) -> Result<()> {
        let (from, transitional, to) = op.states();
        if self.state != from {
            return Err(PipeflowError::StateMachine {
                from: self.state,
                to: transitional,
            });
        }
        tracing::debug!("application '{}': {} -> {}", self.name, from, to);
        self.state = transitional;
        let result = self.pool.broadcast(ThreadOperation::Lifecycle(op));
        // the stable state is entered even when a filter failed: the
        // per-filter states record what was actually reached, and shutdown
        // runs the inverse sequence from there
        self.state = to;
        result
    }

    /// Initialize all filters (`Constructed` -> `Initialized`).
    pub fn init(&mut self) -> Result<()> {
        self.lifecycle(Operation::Init)
    }

    /// Open all filters (`Initialized` -> `Opened`). Materializes every
    /// connection first; ports are frozen from here on.
    pub fn open(&mut self) -> Result<()> {
        if self.state != FilterState::Initialized {
            return Err(PipeflowError::StateMachine {
                from: self.state,
                to: FilterState::Opening,
            });
        }
        if let Err(e) = self.setup_connections() {
            self.teardown_connections();
            return Err(e);
        }
        self.lifecycle(Operation::Open)
    }

    /// Start data flow (`Opened` -> `Active`).
    pub fn start(&mut self) -> Result<()> {
        if self.state != FilterState::Opened {
            return Err(PipeflowError::StateMachine {
                from: self.state,
                to: FilterState::Starting,
            });
        }
        for connection in &self.inter_thread_connections {
            connection.set_stopped(false);
        }
        self.lifecycle(Operation::Start)
    }

    /// Stop data flow (`Active` -> `Opened`). New samples are rejected at
    /// the connection boundary; in-flight samples are drained subject to
    /// the per-port finalize cap.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != FilterState::Active {
            return Err(PipeflowError::StateMachine {
                from: self.state,
                to: FilterState::Stopping,
            });
        }
        for connection in &self.inter_thread_connections {
            connection.set_stopped(true);
        }
        self.lifecycle(Operation::Stop)
    }

    /// Close all filters (`Opened` -> `Initialized`) and tear down the
    /// connections.
    pub fn close(&mut self) -> Result<()> {
        let result = self.lifecycle(Operation::Close);
        if self.state == FilterState::Initialized {
            self.teardown_connections();
        }
        result
    }

    /// Deinitialize all filters (`Initialized` -> `Constructed`).
    pub fn deinit(&mut self) -> Result<()> {
        self.lifecycle(Operation::Deinit)
    }

    /// Drop all filter instances and stop the worker threads
    /// (`Constructed` -> `Destructed`).
    pub fn destruct(&mut self) -> Result<()> {
        if self.state != FilterState::Constructed {
            return Err(PipeflowError::StateMachine {
                from: self.state,
                to: FilterState::Destructing,
            });
        }
        self.state = FilterState::Destructing;
        let result = self.pool.broadcast(ThreadOperation::Destruct);
        self.state = FilterState::Destructed;
        self.filters.clear();
        self.pool.shutdown();
        result
    }

    /// Drive the graph from `Constructed` all the way to `Active`. On
    /// failure the inverse sequence is run from the states the filters
    /// reached, and the original error is returned.
    pub fn run_to_active(&mut self) -> Result<()> {
        let steps: [fn(&mut Self) -> Result<()>; 3] = [Self::init, Self::open, Self::start];
        for step in steps {
            if let Err(e) = step(self) {
                tracing::error!(
                    "application '{}' failed to start, unwinding: {}",
                    self.name,
                    e
                );
                if let Err(shutdown_err) = self.shutdown() {
                    tracing::error!("shutdown after failed start also failed: {}", shutdown_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run the inverse sequence from the current state down to
    /// `Destructed`.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == FilterState::Active {
            self.stop()?;
        }
        if self.state == FilterState::Opened {
            self.close()?;
        }
        if self.state == FilterState::Initialized {
            self.deinit()?;
        }
        if self.state == FilterState::Constructed {
            self.destruct()?;
        }
        if self.state != FilterState::Destructed {
            return Err(PipeflowError::Internal(format!(
                "unexpected state {} after shutdown",
                self.state
            )));
        }
        Ok(())
    }

    /// Create the transport for every configured edge. Same-thread edges
    /// become direct connections; cross-thread edges get a credit-bounded
    /// inter-thread connection.
    fn setup_connections(&mut self) -> Result<()> {
        if self.graph_connected {
            return Ok(());
        }
        for spec in &self.connection_specs {
            let from_env = self
                .filters
                .get(&spec.from_filter)
                .ok_or_else(|| PipeflowError::FilterNotFound(spec.from_filter.clone()))?;
            let to_env = self
                .filters
                .get(&spec.to_filter)
                .ok_or_else(|| PipeflowError::FilterNotFound(spec.to_filter.clone()))?;
            let output = from_env.get_output_port(&spec.from_port)?;
            let input = to_env.get_input_port(&spec.to_port)?;
            if from_env.thread_id() == to_env.thread_id() {
                setup_direct_connection(&output, &input)?;
            } else {
                let connection = setup_inter_thread_connection(&output, &input, spec.width)?;
                self.inter_thread_connections.push(connection);
            }
        }
        self.graph_connected = true;
        Ok(())
    }

    fn teardown_connections(&mut self) {
        for env in self.filters.values() {
            for output in env.output_ports() {
                output.clear_connections();
            }
        }
        self.inter_thread_connections.clear();
        self.graph_connected = false;
    }
}

impl Drop for ActiveApplication {
    fn drop(&mut self) {
        if self.state != FilterState::Destructed {
            tracing::warn!(
                "application '{}' dropped in state {}; shutting down",
                self.name,
                self.state
            );
            if let Err(e) = self.shutdown() {
                tracing::error!("shutdown in drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::filter::Filter;
    use crate::ports::{InputPort, OutputPort, Port};
    use std::collections::BTreeMap;

    struct Passthrough {
        output: OutputPort,
    }

    impl Filter for Passthrough {
        fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
            let sample = port.get_data(0, -1.0)?;
            self.output.transmit(&sample)
        }
    }

    fn passthrough_registry() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("Passthrough", |env| {
            let input = InputPort::new(false, "in", env, 1, -1.0);
            env.add_port(Port::Input(input))?;
            let output = OutputPort::new(false, "out", env);
            env.add_port(Port::Output(output.clone()))?;
            Ok(Box::new(Passthrough { output }) as Box<dyn Filter>)
        });
        registry
    }

    fn node(name: &str, thread: &str) -> NodeConfig {
        NodeConfig {
            name: name.to_string(),
            library: "builtin".to_string(),
            factory_function: "Passthrough".to_string(),
            thread: thread.to_string(),
            static_input_ports: vec!["in".to_string()],
            static_output_ports: vec!["out".to_string()],
            dynamic_input_ports: Vec::new(),
            dynamic_output_ports: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    fn two_node_config() -> ApplicationConfig {
        ApplicationConfig {
            name: "test".to_string(),
            nodes: vec![node("first", "worker_a"), node("second", "worker_b")],
            connections: vec!["first.out -> second.in".to_string()],
        }
    }

    #[test]
    fn test_full_lifecycle_state_sequence() {
        let registry = passthrough_registry();
        let mut app = ActiveApplication::new(&two_node_config(), &registry).unwrap();
        assert_eq!(app.state(), FilterState::Constructed);
        app.init().unwrap();
        assert_eq!(app.state(), FilterState::Initialized);
        app.open().unwrap();
        assert_eq!(app.state(), FilterState::Opened);
        assert_eq!(app.connections().len(), 1);
        app.start().unwrap();
        assert_eq!(app.state(), FilterState::Active);
        for env in [
            app.get_filter("first").unwrap(),
            app.get_filter("second").unwrap(),
        ] {
            assert_eq!(env.state(), FilterState::Active);
        }
        app.stop().unwrap();
        app.close().unwrap();
        app.deinit().unwrap();
        app.destruct().unwrap();
        assert_eq!(app.state(), FilterState::Destructed);
    }

    #[test]
    fn test_operations_must_follow_sequence() {
        let registry = passthrough_registry();
        let mut app = ActiveApplication::new(&two_node_config(), &registry).unwrap();
        assert!(matches!(
            app.start(),
            Err(PipeflowError::StateMachine { .. })
        ));
        assert!(matches!(app.stop(), Err(PipeflowError::StateMachine { .. })));
        app.shutdown().unwrap();
    }

    #[test]
    fn test_same_thread_nodes_get_direct_connection() {
        let registry = passthrough_registry();
        let config = ApplicationConfig {
            name: "direct".to_string(),
            nodes: vec![node("first", "shared"), node("second", "shared")],
            connections: vec!["first.out -> second.in".to_string()],
        };
        let mut app = ActiveApplication::new(&config, &registry).unwrap();
        app.init().unwrap();
        app.open().unwrap();
        // no inter-thread connection was created
        assert!(app.connections().is_empty());
        let output = app
            .get_filter("first")
            .unwrap()
            .get_output_port("out")
            .unwrap();
        assert_eq!(output.connection_count(), 1);
        app.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_factory_is_a_config_error() {
        let registry = PluginRegistry::new();
        let result = ActiveApplication::new(&two_node_config(), &registry);
        assert!(matches!(result, Err(PipeflowError::Config(_))));
    }

    #[test]
    fn test_unknown_connection_port_fails_open() {
        let registry = passthrough_registry();
        let config = ApplicationConfig {
            name: "bad_port".to_string(),
            nodes: vec![node("first", "a"), node("second", "b")],
            connections: vec!["first.video -> second.in".to_string()],
        };
        let mut app = ActiveApplication::new(&config, &registry).unwrap();
        app.init().unwrap();
        assert!(matches!(app.open(), Err(PipeflowError::PortNotFound(_))));
        app.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_from_active() {
        let registry = passthrough_registry();
        let mut app = ActiveApplication::new(&two_node_config(), &registry).unwrap();
        app.run_to_active().unwrap();
        app.shutdown().unwrap();
        assert_eq!(app.state(), FilterState::Destructed);
    }
}
