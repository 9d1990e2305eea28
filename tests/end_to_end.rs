//! Whole-graph scenarios: sources, filters and the scheduler together.

mod common;

use common::builders::{digital_set, filter_after, spi_transfer, ToneBuilder};
use common::mock_helpers::{acquire_once, spi_channels};
use common::{assert_float_eq, scalar, waveform, write_two_port};
use scopeflow::filters::{
    ac_rms, bandwidth, emphasis, fft, reference_plane, spi, touchstone, SpiSymbol,
};
use scopeflow::graph::{FilterGraph, ParameterValue};
use scopeflow::instrument::{ChannelInfo, WaveformSet};
use scopeflow::scheduler::Scheduler;
use scopeflow::waveform::{UniformWaveform, Waveform};

fn refresh(graph: &mut FilterGraph) {
    let stats = Scheduler::cpu_only().refresh(graph);
    assert_eq!(stats.errors, 0, "refresh reported errors: {:?}", stats);
}

fn load_touchstone(graph: &mut FilterGraph, path: &std::path::Path) -> scopeflow::NodeId {
    let id = graph.create_filter(touchstone::NAME, "#ffffff").unwrap();
    graph
        .set_parameter(
            id,
            touchstone::PARAM_FILE_NAME,
            &ParameterValue::Filename(path.to_string_lossy().into_owned()),
        )
        .unwrap();
    id
}

#[test]
fn test_tone_into_ac_rms() {
    let mut graph = FilterGraph::new();
    let tone = ToneBuilder::new()
        .sample_rate(1e9)
        .frequency(1e6)
        .amplitude(2.0)
        .depth(1_000_000)
        .add_to(&mut graph);
    let rms = filter_after(&mut graph, ac_rms::NAME, &[(tone, "data")]);
    refresh(&mut graph);

    let value = scalar(&graph, rms, "rms").unwrap();
    assert_float_eq(value, 0.7071, 0.005);

    let trend = waveform(&graph, rms, "trend").unwrap().analog().unwrap();
    assert_eq!(trend.len(), 999);
    assert!(trend.samples().iter().all(|&v| (v - 0.7071).abs() < 0.005));
}

#[test]
fn test_tone_spectrum_peak() {
    let mut graph = FilterGraph::new();
    let tone = ToneBuilder::new()
        .sample_rate(1e9)
        .frequency(1e8)
        .amplitude(1.0)
        .depth(1024)
        .add_to(&mut graph);
    let spectrum = filter_after(&mut graph, fft::NAME, &[(tone, "data")]);
    refresh(&mut graph);

    let mag = waveform(&graph, spectrum, "magnitude").unwrap().analog().unwrap();
    let (peak, _) = mag
        .samples()
        .iter()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    let bin_width = 1e9 / 1024.0;
    // The spectrum axis is stored in millihertz
    let peak_hz = mag.offset_scaled(peak) as f64 * 1e-3;
    assert!(
        (peak_hz - 1e8).abs() <= bin_width / 2.0,
        "peak at {} Hz (bin {})",
        peak_hz,
        peak
    );
}

#[test]
fn test_touchstone_reference_plane_extension() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_two_port(
        dir.path(),
        "thru.s2p",
        &[(1000.0, -0.5, 0.0), (5000.0, -1.0, 0.0), (10000.0, -2.0, 0.0)],
    );

    let mut graph = FilterGraph::new();
    let import = load_touchstone(&mut graph, &path);
    let plane = graph.create_filter(reference_plane::NAME, "#ffffff").unwrap();
    graph
        .set_parameter(plane, "Port 1 Shift", &ParameterValue::Float(100_000.0))
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
    refresh(&mut graph);

    let s21 = waveform(&graph, plane, "S21_ang").unwrap().analog().unwrap();
    assert_eq!(s21.offset_scaled(2), 10_000_000_000);
    assert!((s21.value(2) + 360.0).abs() < 1e-3, "got {}", s21.value(2));
    assert!((s21.value(0) + 36.0).abs() < 1e-3);

    // Port 2 carries no shift, and magnitudes pass through
    let s22 = waveform(&graph, plane, "S22_ang").unwrap().analog().unwrap();
    let s22_in = waveform(&graph, import, "S22_ang").unwrap().analog().unwrap();
    assert_eq!(s22.samples(), s22_in.samples());
    let mag = waveform(&graph, plane, "S21_mag").unwrap().analog().unwrap();
    assert!((mag.value(2) + 2.0).abs() < 1e-4);
}

#[test]
fn test_emphasis_step_response() {
    let step: Vec<f32> = (0..400).map(|i| if i >= 100 { 1.0 } else { 0.0 }).collect();
    let mut set = WaveformSet::new();
    set.insert((0, 0), Waveform::from(UniformWaveform::from_samples(step, 100_000)));

    let mut graph = FilterGraph::new();
    let channels = acquire_once(&mut graph, vec![ChannelInfo::analog("CH1", "#ffff00")], set);
    let filter = filter_after(&mut graph, emphasis::NAME, &[(channels[0], "data")]);
    refresh(&mut graph);

    // 10 GSa/s at 1.25 Gb/s is 8 samples per tap; output starts one tap in
    let tap = 8;
    let out = waveform(&graph, filter, "data").unwrap().analog().unwrap();
    assert_eq!(out.header().trigger_phase, tap as i64 * 100_000);
    let at = |sample: usize| out.value(sample - tap) as f64;

    let e = 10f64.powf(-0.3);
    assert_float_eq(at(100), (e + 1.0) / 2.0, 1e-6);
    assert_float_eq(at(100), 0.7506, 1e-4);
    assert_float_eq(at(100 + tap), e, 1e-6);
    assert_eq!(at(99), 0.0);
}

#[test]
fn test_spi_single_byte_from_instrument() {
    let [clk, cs, data] = spi_transfer(&[0xa5]);
    let set = digital_set(&[clk, cs, data], 1000);

    let mut graph = FilterGraph::new();
    let channels = acquire_once(&mut graph, spi_channels(), set);
    let decoder = filter_after(
        &mut graph,
        spi::NAME,
        &[(channels[0], "data"), (channels[1], "data"), (channels[2], "data")],
    );
    refresh(&mut graph);

    let w = waveform(&graph, decoder, "data").unwrap();
    let p = w.protocol().unwrap().downcast_ref::<SpiSymbol>().unwrap();
    assert_eq!(
        p.symbols,
        vec![SpiSymbol::Select, SpiSymbol::Data(0xa5), SpiSymbol::Deselect]
    );
    let texts: Vec<String> = (0..3).map(|i| w.protocol().unwrap().text(i)).collect();
    assert_eq!(texts, ["SELECT", "a5", "DESELECT"]);
}

#[test]
fn test_bandwidth_of_imported_response() {
    // 1 MHz points, flat to 500 MHz where the response is exactly -3 dB
    let corner = 500.0;
    let points: Vec<(f64, f64, f64)> = (1..=2000)
        .map(|i| {
            let f = i as f64;
            let db = if f <= corner {
                -3.0 * (f / corner).powi(8)
            } else {
                -3.0 - 20.0 * (f / corner).log10()
            };
            (f, db, 0.0)
        })
        .collect();
    let dir = tempfile::tempdir().unwrap();
    let path = write_two_port(dir.path(), "lowpass.s2p", &points);

    let mut graph = FilterGraph::new();
    let import = load_touchstone(&mut graph, &path);
    let bw = filter_after(&mut graph, bandwidth::NAME, &[(import, "S21_mag")]);
    graph
        .set_parameter(bw, bandwidth::PARAM_REFERENCE, &ParameterValue::Float(0.0))
        .unwrap();
    refresh(&mut graph);

    let hz = scalar(&graph, bw, "bandwidth").unwrap();
    assert!((hz - 500e6).abs() <= 1e6, "bandwidth {} Hz", hz);
}

#[test]
fn test_refresh_is_deterministic() {
    let build = || {
        let mut graph = FilterGraph::new();
        let tone = ToneBuilder::new().frequency(3e6).depth(4096).add_to(&mut graph);
        let spectrum = filter_after(&mut graph, fft::NAME, &[(tone, "data")]);
        refresh(&mut graph);
        let mag = waveform(&graph, spectrum, "magnitude").unwrap().analog().unwrap();
        mag.samples().iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    };
    assert_eq!(build(), build());
}
