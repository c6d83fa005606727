//! # pipeflow: a data-flow runtime for processing pipelines
//!
//! pipeflow runs computer-vision and signal-processing pipelines as
//! directed graphs of *filters* connected through *ports*. Filters are
//! hosted on named worker threads; every callback into a filter executes on
//! that filter's owning thread, sample order along any edge is preserved,
//! and the whole graph moves through a coordinated lifecycle
//! (init/open/start ... stop/close/deinit).
//!
//! ## Architecture
//!
//! - **Filters** implement the [`Filter`] trait and exchange immutable
//!   [`DataSample`]s through named input/output ports.
//! - **Threads**: each named worker runs a serial event loop with one
//!   cooperative [`executor::Executor`] draining pending deliveries.
//! - **Transport**: same-thread edges deliver through the shared executor;
//!   cross-thread edges are bounded by a credit semaphore (back-pressure),
//!   optionally with a dynamic queue that absorbs bursts.
//! - **Lifecycle**: an [`ActiveApplication`] drives every filter through
//!   the state machine in lock step and contains filter failures.
//!
//! ## Example
//!
//! ```ignore
//! use pipeflow::{
//!     ActiveApplication, DataSample, Filter, GraphConfig, InputPort, OutputPort,
//!     PluginRegistry, Port, Result,
//! };
//!
//! struct Doubler {
//!     output: OutputPort,
//! }
//!
//! impl Filter for Doubler {
//!     fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
//!         let sample = port.get_data(0, -1.0)?;
//!         self.output.transmit(&DataSample::copy(&sample))
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut registry = PluginRegistry::new();
//!     registry.register("Doubler", |env| {
//!         let input = InputPort::new(false, "in", env, 1, -1.0);
//!         env.add_port(Port::Input(input))?;
//!         let output = OutputPort::new(false, "out", env);
//!         env.add_port(Port::Output(output.clone()))?;
//!         Ok(Box::new(Doubler { output }) as Box<dyn Filter>)
//!     });
//!
//!     let config = GraphConfig::load("graph.json")?;
//!     let mut app = ActiveApplication::new(config.application("demo")?, &registry)?;
//!     app.run_to_active()?;
//!     // ... pipeline is running ...
//!     app.shutdown()
//! }
//! ```

pub mod app;
pub mod config;
pub mod environment;
pub mod error;
pub mod executor;
pub mod filter;
pub mod plugin;
pub mod ports;
pub mod properties;
pub mod sample;
pub mod services;
pub(crate) mod thread;

// Re-export commonly used types
pub use app::ActiveApplication;
pub use config::{ApplicationConfig, ConnectionConfig, GraphConfig, NodeConfig};
pub use environment::FilterEnvironment;
pub use error::{PipeflowError, Result};
pub use filter::{Filter, FilterState};
pub use plugin::{FilterFactory, PluginRegistry};
pub use ports::{InputPort, InterThreadConnection, OutputPort, Port, PortDirection};
pub use properties::{PropertyCollection, PropertyValue};
pub use sample::{DataSample, SharedDataSample, TIMESTAMP_RES};
pub use services::{LogLevel, Logging, Profiling, Services, TracingLogger};
