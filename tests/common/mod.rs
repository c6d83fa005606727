//! Shared helpers for the integration tests: small test filters, registry
//! builders and graph-document shorthand.

#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use pipeflow::{
    ApplicationConfig, Filter, InputPort, NodeConfig, OutputPort, PipeflowError, PluginRegistry,
    Port, Result,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Install a fmt subscriber honoring `RUST_LOG`; safe to call from every
/// test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// One observed delivery, reported by the consumer filters below.
#[derive(Debug, Clone)]
pub struct Received {
    pub timestamp: i64,
    pub queue_len: usize,
}

/// A source filter with a single static output port "out". Emission is
/// driven from tests via `ActiveApplication::post_to_thread`.
pub struct SourceFilter;

impl Filter for SourceFilter {}

pub fn register_source(registry: &mut PluginRegistry, factory: &str) {
    registry.register(factory, |env| {
        let output = OutputPort::new(false, "out", env);
        env.add_port(Port::Output(output))?;
        Ok(Box::new(SourceFilter) as Box<dyn Filter>)
    });
}

/// A consumer filter with a single static input port "in". Optionally
/// sleeps per sample (slow-consumer scenarios), then reports the sample's
/// timestamp and the current queue length.
pub struct RecorderFilter {
    tx: Sender<Received>,
    delay: Duration,
}

impl Filter for RecorderFilter {
    fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let sample = port.get_data(0, -1.0)?;
        let _ = self.tx.send(Received {
            timestamp: sample.timestamp(),
            queue_len: port.queue_length()?,
        });
        Ok(())
    }
}

pub fn register_recorder(
    registry: &mut PluginRegistry,
    factory: &str,
    tx: Sender<Received>,
    queue_size_samples: i64,
    dynamic_queue: bool,
    delay: Duration,
) {
    registry.register(factory, move |env| {
        let input = InputPort::new(false, "in", env, queue_size_samples, -1.0);
        if dynamic_queue {
            input.set_interthread_dynamic_queue(true);
        }
        env.add_port(Port::Input(input))?;
        Ok(Box::new(RecorderFilter {
            tx: tx.clone(),
            delay,
        }) as Box<dyn Filter>)
    });
}

/// A consumer that reports every sample but fails on every `fail_each`-th
/// delivery.
pub struct FlakyFilter {
    tx: Sender<Received>,
    fail_each: usize,
    count: usize,
}

impl Filter for FlakyFilter {
    fn on_port_data_changed(&mut self, port: &InputPort) -> Result<()> {
        self.count += 1;
        let sample = port.get_data(0, -1.0)?;
        let _ = self.tx.send(Received {
            timestamp: sample.timestamp(),
            queue_len: port.queue_length()?,
        });
        if self.count % self.fail_each == 0 {
            return Err(PipeflowError::Internal(format!(
                "intentional failure on sample {}",
                self.count
            )));
        }
        Ok(())
    }
}

pub fn register_flaky(
    registry: &mut PluginRegistry,
    factory: &str,
    tx: Sender<Received>,
    fail_each: usize,
) {
    registry.register(factory, move |env| {
        let input = InputPort::new(false, "in", env, 1, -1.0);
        env.add_port(Port::Input(input))?;
        Ok(Box::new(FlakyFilter {
            tx: tx.clone(),
            fail_each,
            count: 0,
        }) as Box<dyn Filter>)
    });
}

/// Shared log of `(filter name, callback name)` entries.
pub type CallLog = Arc<Mutex<Vec<(String, &'static str)>>>;

/// A filter recording each lifecycle callback, optionally failing in one
/// of them.
pub struct LifecycleProbe {
    name: String,
    log: CallLog,
    fail_in: Option<&'static str>,
}

impl LifecycleProbe {
    fn hook(&mut self, callback: &'static str) -> Result<()> {
        self.log.lock().unwrap().push((self.name.clone(), callback));
        if self.fail_in == Some(callback) {
            return Err(PipeflowError::Internal(format!(
                "intentional failure in {}",
                callback
            )));
        }
        Ok(())
    }
}

impl Filter for LifecycleProbe {
    fn on_init(&mut self) -> Result<()> {
        self.hook("on_init")
    }
    fn on_open(&mut self) -> Result<()> {
        self.hook("on_open")
    }
    fn on_start(&mut self) -> Result<()> {
        self.hook("on_start")
    }
    fn on_stop(&mut self) -> Result<()> {
        self.hook("on_stop")
    }
    fn on_close(&mut self) -> Result<()> {
        self.hook("on_close")
    }
    fn on_deinit(&mut self) -> Result<()> {
        self.hook("on_deinit")
    }
}

pub fn register_lifecycle_probe(
    registry: &mut PluginRegistry,
    factory: &str,
    log: CallLog,
    fail_in: Option<&'static str>,
) {
    registry.register(factory, move |env| {
        Ok(Box::new(LifecycleProbe {
            name: env.name().to_string(),
            log: log.clone(),
            fail_in,
        }) as Box<dyn Filter>)
    });
}

/// Build a node entry for a programmatic application config.
pub fn node(name: &str, thread: &str, factory: &str) -> NodeConfig {
    NodeConfig {
        name: name.to_string(),
        library: "test".to_string(),
        factory_function: factory.to_string(),
        thread: thread.to_string(),
        static_input_ports: Vec::new(),
        static_output_ports: Vec::new(),
        dynamic_input_ports: Vec::new(),
        dynamic_output_ports: Vec::new(),
        properties: BTreeMap::new(),
    }
}

pub fn app_config(name: &str, nodes: Vec<NodeConfig>, connections: &[&str]) -> ApplicationConfig {
    ApplicationConfig {
        name: name.to_string(),
        nodes,
        connections: connections.iter().map(|s| s.to_string()).collect(),
    }
}

/// Receive exactly `n` deliveries, failing the test on timeout.
pub fn drain_received(rx: &Receiver<Received>, n: usize, timeout: Duration) -> Vec<Received> {
    let deadline = Instant::now() + timeout;
    let mut received = Vec::with_capacity(n);
    while received.len() < n {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        match rx.recv_timeout(remaining) {
            Ok(r) => received.push(r),
            Err(_) => panic!(
                "timed out waiting for deliveries: got {} of {}",
                received.len(),
                n
            ),
        }
    }
    received
}
