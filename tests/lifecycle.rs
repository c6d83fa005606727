//! Lifecycle sequencing across threads: callback ordering, failure
//! unwinding and shutdown draining.

mod common;

use common::{
    app_config, node, register_lifecycle_probe, register_recorder, register_source, CallLog,
};
use crossbeam_channel::unbounded;
use pipeflow::{ActiveApplication, DataSample, FilterState, PluginRegistry};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn position(log: &[(String, &'static str)], filter: &str, callback: &str) -> usize {
    log.iter()
        .position(|(f, c)| f == filter && *c == callback)
        .unwrap_or_else(|| panic!("{} of {} was not called", callback, filter))
}

#[test]
fn test_lifecycle_callback_ordering() {
    common::init_tracing();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    register_lifecycle_probe(&mut registry, "Probe", log.clone(), None);

    let config = app_config(
        "ordering",
        vec![node("alpha", "t1", "Probe"), node("beta", "t2", "Probe")],
        &[],
    );
    let mut app = ActiveApplication::new(&config, &registry).unwrap();
    app.run_to_active().unwrap();
    app.shutdown().unwrap();

    let log = log.lock().unwrap();
    // per filter: the full sequence, in order
    for filter in ["alpha", "beta"] {
        let calls: Vec<&str> = log
            .iter()
            .filter(|(f, _)| f == filter)
            .map(|(_, c)| *c)
            .collect();
        assert_eq!(
            calls,
            vec!["on_init", "on_open", "on_start", "on_stop", "on_close", "on_deinit"],
            "callback sequence of {}",
            filter
        );
    }
    // across filters: transitions are globally sequenced
    for filter in ["alpha", "beta"] {
        for other in ["alpha", "beta"] {
            assert!(
                position(&log, filter, "on_init") < position(&log, other, "on_open"),
                "{}'s on_init must precede {}'s on_open",
                filter,
                other
            );
            assert!(
                position(&log, filter, "on_stop") < position(&log, other, "on_close"),
                "{}'s on_stop must precede {}'s on_close",
                filter,
                other
            );
        }
    }
}

#[test]
fn test_open_failure_unwinds_partial_graph() {
    common::init_tracing();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    register_lifecycle_probe(&mut registry, "Probe", log.clone(), None);
    register_lifecycle_probe(&mut registry, "FailsOpen", log.clone(), Some("on_open"));

    let config = app_config(
        "unwind",
        vec![node("good", "t1", "Probe"), node("bad", "t2", "FailsOpen")],
        &[],
    );
    let mut app = ActiveApplication::new(&config, &registry).unwrap();
    let err = app.run_to_active();
    assert!(err.is_err(), "open failure must abort the forward sequence");
    assert_eq!(app.state(), FilterState::Destructed);

    let log = log.lock().unwrap();
    let calls_of = |filter: &str| -> Vec<&str> {
        log.iter()
            .filter(|(f, _)| f == filter)
            .map(|(_, c)| *c)
            .collect()
    };
    // the failed filter never completed on_open, so on_close is skipped;
    // on_deinit still runs because on_init had completed
    assert_eq!(calls_of("bad"), vec!["on_init", "on_open", "on_deinit"]);
    // the healthy filter is unwound through its full inverse sequence
    assert_eq!(calls_of("good"), vec!["on_init", "on_open", "on_close", "on_deinit"]);
}

#[test]
fn test_init_failure_skips_deinit() {
    common::init_tracing();
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = PluginRegistry::new();
    register_lifecycle_probe(&mut registry, "FailsInit", log.clone(), Some("on_init"));

    let config = app_config("init_fail", vec![node("solo", "t1", "FailsInit")], &[]);
    let mut app = ActiveApplication::new(&config, &registry).unwrap();
    assert!(app.run_to_active().is_err());
    assert_eq!(app.state(), FilterState::Destructed);

    let log = log.lock().unwrap();
    let calls: Vec<&str> = log.iter().map(|(_, c)| *c).collect();
    // a filter that failed on_init is not asked to run on_deinit
    assert_eq!(calls, vec!["on_init"]);
}

#[test]
fn test_stop_drains_inflight_and_rejects_new_samples() {
    common::init_tracing();
    let (tx, rx) = unbounded();
    let mut registry = PluginRegistry::new();
    register_source(&mut registry, "Source");
    // 100 ms per sample so deliveries are still pending when stop arrives
    register_recorder(
        &mut registry,
        "VerySlow",
        tx,
        8,
        false,
        Duration::from_millis(100),
    );

    let config = app_config(
        "drain",
        vec![node("src", "producer", "Source"), node("sink", "consumer", "VerySlow")],
        // width 0: no flow control, the consumer queue takes the burst
        &["src.out -0> sink.in"],
    );
    let mut app = ActiveApplication::new(&config, &registry).unwrap();
    app.run_to_active().unwrap();

    let output = app
        .get_filter("src")
        .unwrap()
        .get_output_port("out")
        .unwrap();
    let out = output.clone();
    app.post_to_thread("producer", move || {
        for i in 0..10 {
            let sample = DataSample::new(Vec::new(), "test/counter", i);
            out.transmit(&sample).unwrap();
        }
    })
    .unwrap();

    // let the consumer start working on the burst, then stop the graph
    std::thread::sleep(Duration::from_millis(150));
    let stop_started = Instant::now();
    app.stop().unwrap();
    assert_eq!(app.state(), FilterState::Opened);
    // the transition completes despite queued samples: finalize drains
    // them (capped per port) instead of waiting for normal delivery
    assert!(
        stop_started.elapsed() < Duration::from_secs(3),
        "stop took {:?}",
        stop_started.elapsed()
    );

    // active-state deliveries happened, but not the full burst
    let processed = rx.try_iter().count();
    assert!(processed >= 1, "consumer never ran");
    assert!(processed < 10, "stop did not interrupt the burst");

    // the stopped connection rejects new samples
    let out = output.clone();
    app.post_to_thread("producer", move || {
        let sample = DataSample::new(Vec::new(), "test/counter", 99);
        out.transmit(&sample).unwrap();
    })
    .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    app.shutdown().unwrap();
}
