//! Benchmarks for waveform processing kernels
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rustfft::FftPlanner;
use scopeflow::compute::ComputeContext;
use scopeflow::config::SchedulerConfig;
use scopeflow::filters::emphasis::{apply_emphasis, EmphasisTaps, EmphasisType};
use scopeflow::filters::fft::{compute_spectrum, WindowFunction};
use scopeflow::filters::tone::{self, ToneSettings};
use scopeflow::filters::{ac_rms, peak};
use scopeflow::graph::{FilterGraph, ParameterValue};
use scopeflow::scheduler::Scheduler;
use scopeflow::waveform::{AnalogView, UniformWaveform};

const SIZES: [usize; 3] = [1024, 65_536, 1_048_576];

fn settings(depth: usize) -> ToneSettings {
    ToneSettings {
        sample_rate: 1e9,
        frequency: 1e6,
        amplitude: 2.0,
        bias: 0.0,
        start_phase: 0.0,
        depth,
    }
}

fn bench_tone(c: &mut Criterion) {
    let mut group = c.benchmark_group("tone_generate");
    for size in SIZES {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let s = settings(size);
            b.iter(|| black_box(s.generate()));
        });
    }
    group.finish();
}

fn bench_ac_rms(c: &mut Criterion) {
    let mut group = c.benchmark_group("ac_rms");
    for size in SIZES {
        let w = UniformWaveform::from_samples(settings(size).generate(), 1000);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &w, |b, w| {
            b.iter(|| black_box(ac_rms::measure(AnalogView::Uniform(w))));
        });
    }
    group.finish();
}

fn bench_fft(c: &mut Criterion) {
    let mut group = c.benchmark_group("spectrum");
    for size in SIZES {
        let samples = settings(size).generate();
        let mut planner = FftPlanner::new();
        group.throughput(Throughput::Elements(size as u64));
        for window in [WindowFunction::Rectangular, WindowFunction::Blackman] {
            let id = BenchmarkId::new(window.display_name(), size);
            group.bench_with_input(id, &samples, |b, samples| {
                b.iter(|| black_box(compute_spectrum(&mut planner, samples, 1000, window, true)));
            });
        }
    }
    group.finish();
}

fn bench_emphasis(c: &mut Criterion) {
    let mut group = c.benchmark_group("emphasis");
    let taps = EmphasisTaps::new(EmphasisType::PreEmphasis, 6.0);
    for size in SIZES {
        let samples = settings(size).generate();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &samples, |b, samples| {
            b.iter(|| black_box(apply_emphasis(samples, 8, taps)));
        });
    }
    group.finish();
}

fn bench_graph_refresh(c: &mut Criterion) {
    let mut graph = FilterGraph::new();
    let src = graph.create_filter(tone::NAME, "#ffff00").unwrap();
    graph
        .set_parameter(src, tone::PARAM_DEPTH, &ParameterValue::Int(65_536))
        .unwrap();
    let data = graph.stream_ref(src, "data").unwrap();
    for class in [ac_rms::NAME, peak::NAME, scopeflow::filters::fft::NAME] {
        let id = graph.create_filter(class, "#00ffff").unwrap();
        graph.set_input(id, 0, Some(data)).unwrap();
    }

    // Skipping would turn every iteration after the first into a no-op
    let config = SchedulerConfig {
        skip_unchanged: false,
        ..SchedulerConfig::default()
    };
    let mut scheduler = Scheduler::new(ComputeContext::cpu_only(), config);
    c.bench_function("graph_refresh_64k", |b| {
        b.iter(|| black_box(scheduler.refresh(&mut graph)));
    });
}

criterion_group!(
    benches,
    bench_tone,
    bench_ac_rms,
    bench_fft,
    bench_emphasis,
    bench_graph_refresh
);
criterion_main!(benches);
