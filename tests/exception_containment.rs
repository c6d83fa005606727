//! Filter errors in data callbacks are contained at the port boundary:
//! they are logged, the sample is considered consumed, and the pipeline
//! keeps running.

mod common;

use common::{app_config, drain_received, node, register_flaky, register_source};
use crossbeam_channel::unbounded;
use pipeflow::{ActiveApplication, DataSample, FilterState, PluginRegistry};
use std::time::Duration;

#[test]
fn test_data_callback_errors_do_not_stop_the_pipeline() {
    common::init_tracing();
    let (tx, rx) = unbounded();
    let mut registry = PluginRegistry::new();
    register_source(&mut registry, "Source");
    // fails on every 3rd sample
    register_flaky(&mut registry, "Flaky", tx, 3);

    let config = app_config(
        "containment",
        vec![node("src", "t1", "Source"), node("sink", "t2", "Flaky")],
        &["src.out -> sink.in"],
    );
    let mut app = ActiveApplication::new(&config, &registry).unwrap();
    app.run_to_active().unwrap();

    let output = app
        .get_filter("src")
        .unwrap()
        .get_output_port("out")
        .unwrap();
    app.post_to_thread("t1", move || {
        for i in 0..9 {
            let sample = DataSample::new(Vec::new(), "test/counter", i);
            output.transmit(&sample).unwrap();
        }
    })
    .unwrap();

    // every sample reaches the filter exactly once, failures included
    let received = drain_received(&rx, 9, Duration::from_secs(5));
    let timestamps: Vec<i64> = received.iter().map(|r| r.timestamp).collect();
    assert_eq!(timestamps, (0..9).collect::<Vec<_>>());

    // the graph is still active after three contained failures
    assert_eq!(app.state(), FilterState::Active);
    assert_eq!(app.get_filter("sink").unwrap().state(), FilterState::Active);

    app.shutdown().unwrap();
}
