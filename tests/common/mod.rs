//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use scopeflow::graph::{FilterGraph, NodeId};
use scopeflow::waveform::Waveform;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_millis(100)
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}

/// Scalar value of stream `name` on `node`
pub fn scalar(graph: &FilterGraph, node: NodeId, name: &str) -> Option<f64> {
    let core = graph.node(node)?.core();
    core.stream(core.stream_index(name)?)?.value()
}

/// Waveform of stream `name` on `node`
pub fn waveform<'a>(graph: &'a FilterGraph, node: NodeId, name: &str) -> Option<&'a Waveform> {
    let core = graph.node(node)?.core();
    core.stream(core.stream_index(name)?)?.waveform()
}

/// Errors recorded on `node` in the last refresh
pub fn errors(graph: &FilterGraph, node: NodeId) -> Vec<String> {
    graph
        .node(node)
        .map(|n| n.core().errors().to_vec())
        .unwrap_or_default()
}

/// Write a two-port Touchstone file in dB/angle format.
///
/// `points` are `(frequency in MHz, S21 in dB, S21 angle in degrees)`; the
/// other parameters are a fixed -20 dB reflection and full isolation.
pub fn write_two_port(dir: &Path, name: &str, points: &[(f64, f64, f64)]) -> PathBuf {
    let mut text = String::from("! generated\n# MHZ S DB R 50\n");
    for &(f, db, deg) in points {
        text.push_str(&format!(
            "{} -20 0 {} {} {} {} -20 0\n",
            f, db, deg, db, deg
        ));
    }
    let path = dir.join(name);
    std::fs::write(&path, text).expect("write touchstone fixture");
    path
}
