//! Saving a graph to disk and loading it back.

mod common;

use common::builders::{filter_after, ToneBuilder};
use common::{waveform, write_two_port};
use scopeflow::config::AcquisitionConfig;
use scopeflow::filters::{fft, peak, reference_plane, touchstone};
use scopeflow::graph::{FilterGraph, NodeId, ParameterValue};
use scopeflow::instrument::{AcquisitionController, DemoOscilloscope};
use scopeflow::scheduler::Scheduler;
use scopeflow::serialize::{load_graph, save_graph, GraphDocument};
use std::path::Path;
use std::sync::Arc;

struct Fixture {
    graph: FilterGraph,
    tone: NodeId,
    spectrum: NodeId,
    plane: NodeId,
}

fn fixture(dir: &Path) -> Fixture {
    let mut graph = FilterGraph::new();
    let scope = Arc::new(DemoOscilloscope::new("bench"));
    let channels = graph
        .attach_instrument("bench", Arc::new(AcquisitionController::new(scope, 2)), None)
        .unwrap();
    graph.node_mut(channels[1]).unwrap().core_mut().color = "#123456".to_string();

    let tone = ToneBuilder::new().frequency(2.5e6).amplitude(0.8).depth(2048).add_to(&mut graph);
    let spectrum = filter_after(&mut graph, fft::NAME, &[(tone, "data")]);
    graph
        .set_parameter(spectrum, fft::PARAM_REMOVE_DC, &ParameterValue::Bool(false))
        .unwrap();
    let swing = filter_after(&mut graph, peak::NAME, &[(channels[0], "data")]);
    graph.node_mut(swing).unwrap().core_mut().display_name = "CH1 swing".to_string();

    let path = write_two_port(dir, "cable.s2p", &[(100.0, -0.1, -10.0), (1000.0, -1.0, -100.0)]);
    let import = graph.create_filter(touchstone::NAME, "#808080").unwrap();
    graph
        .set_parameter(
            import,
            touchstone::PARAM_FILE_NAME,
            &ParameterValue::Filename(path.to_string_lossy().into_owned()),
        )
        .unwrap();
    let plane = graph.create_filter(reference_plane::NAME, "#00ff00").unwrap();
    graph
        .set_parameter(plane, "Port 2 Shift", &ParameterValue::Float(-25_000.0))
        .unwrap();
    for to in 1..=2 {
        for from in 1..=2 {
            let (mag, ang) = touchstone::stream_names(to, from);
            for name in [mag, ang] {
                let src = graph.stream_ref(import, &name).unwrap();
                graph.connect(src, plane, &name).unwrap();
            }
        }
    }

    Fixture {
        graph,
        tone,
        spectrum,
        plane,
    }
}

fn samples(graph: &FilterGraph, node: NodeId, stream: &str) -> Vec<u32> {
    waveform(graph, node, stream)
        .and_then(|w| w.analog())
        .map(|v| v.samples().iter().map(|s| s.to_bits()).collect())
        .unwrap_or_default()
}

fn check_reload(extension: &str) {
    let dir = tempfile::tempdir().unwrap();
    let mut f = fixture(dir.path());
    let path = dir.path().join(format!("graph.{}", extension));
    save_graph(&f.graph, &path).unwrap();

    let loaded = load_graph(&path, &AcquisitionConfig::default()).unwrap();
    assert!(loaded.warnings.is_empty(), "warnings: {:?}", loaded.warnings);
    let mut graph = loaded.graph;

    assert_eq!(graph.ids(), f.graph.ids());
    assert_eq!(GraphDocument::from_graph(&graph), GraphDocument::from_graph(&f.graph));

    let handle = graph.instrument("bench").unwrap();
    assert_eq!(handle.channels, f.graph.instrument("bench").unwrap().channels);
    let ch2 = graph.node(handle.channels[1]).unwrap().core();
    assert_eq!(ch2.color, "#123456");

    Scheduler::cpu_only().refresh(&mut f.graph);
    Scheduler::cpu_only().refresh(&mut graph);
    for (node, stream) in [
        (f.tone, "data"),
        (f.spectrum, "magnitude"),
        (f.plane, "S21_ang"),
        (f.plane, "S12_mag"),
    ] {
        let before = samples(&f.graph, node, stream);
        assert!(!before.is_empty(), "{} {} produced nothing", node, stream);
        assert_eq!(before, samples(&graph, node, stream), "{} {}", node, stream);
    }
}

#[test]
fn test_json_reload_reproduces_outputs() {
    check_reload("json");
}

#[test]
fn test_toml_reload_reproduces_outputs() {
    check_reload("toml");
}

#[test]
fn test_saved_document_shape() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(dir.path());
    let doc = GraphDocument::from_graph(&f.graph);

    let bench = &doc.instruments["bench"];
    assert_eq!(bench.driver, "demo");
    assert_eq!(bench.channels.len(), 4);

    let plane = &doc.filters[&f.plane.0.to_string()];
    assert_eq!(plane.class, reference_plane::NAME);
    assert_eq!(plane.inputs.len(), 8);
    assert_eq!(
        plane.parameters.get("Port 2 Shift"),
        Some(&ParameterValue::Float(-25_000.0))
    );

    let spectrum = &doc.filters[&f.spectrum.0.to_string()];
    assert_eq!(spectrum.inputs["din"].node, f.tone);
    let mag = spectrum.streams.iter().find(|s| s.name == "magnitude").unwrap();
    assert_eq!(mag.x_unit, scopeflow::Unit::Millihertz);
    assert_eq!(mag.y_unit, scopeflow::Unit::Db);
}

#[test]
fn test_missing_touchstone_file_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let f = fixture(dir.path());
    let path = dir.path().join("graph.json");
    save_graph(&f.graph, &path).unwrap();
    std::fs::remove_file(dir.path().join("cable.s2p")).unwrap();

    let loaded = load_graph(&path, &AcquisitionConfig::default()).unwrap();
    // The import has no streams, so the plane's inputs cannot be wired
    assert!(!loaded.warnings.is_empty());
    let mut graph = loaded.graph;
    let stats = Scheduler::cpu_only().refresh(&mut graph);
    assert!(stats.errors > 0);
    assert!(!samples(&graph, f.spectrum, "magnitude").is_empty());
}
