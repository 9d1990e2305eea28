//! scopeflow - command line runner
//!
//! Loads a graph document (or builds a demo graph), acquires from every
//! attached instrument and prints the scalar outputs after each refresh.
//!
//! ```text
//! scopeflow [GRAPH] [--config FILE] [--cycles N] [--save FILE]
//! ```

use anyhow::{bail, Context};
use scopeflow::{
    compute::ComputeContext,
    config::{default_config_path, EngineConfig},
    filters,
    graph::{FilterGraph, StreamType},
    instrument::{AcquisitionController, AcquisitionWorker, DemoOscilloscope, Instrument},
    logging,
    scheduler::Scheduler,
    serialize::{self, GraphDocument},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct Args {
    graph: Option<PathBuf>,
    config: Option<PathBuf>,
    cycles: Option<u64>,
    save: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(it.next().context("--config needs a path")?.into()),
            "--save" => args.save = Some(it.next().context("--save needs a path")?.into()),
            "--cycles" => {
                let n = it.next().context("--cycles needs a count")?;
                args.cycles = Some(n.parse().with_context(|| format!("bad cycle count '{}'", n))?);
            }
            flag if flag.starts_with("--") => bail!("unknown option {}", flag),
            path => args.graph = Some(path.into()),
        }
    }
    Ok(args)
}

/// Demo scope with a few measurements hanging off it
fn demo_graph(config: &EngineConfig) -> anyhow::Result<FilterGraph> {
    let mut graph = FilterGraph::new();
    let scope: Arc<dyn Instrument> = Arc::new(DemoOscilloscope::new("demo"));
    let controller = Arc::new(AcquisitionController::from_config(scope, &config.acquisition));
    let channels = graph.attach_instrument("demo", controller, None)?;

    let rms = graph.create_filter(filters::ac_rms::NAME, "#00ffff")?;
    graph.connect(graph.stream_ref(channels[0], "data")?, rms, "din")?;
    let peak = graph.create_filter(filters::peak::NAME, "#ff00ff")?;
    graph.connect(graph.stream_ref(channels[1], "data")?, peak, "din")?;
    let fft = graph.create_filter(filters::fft::NAME, "#ffff00")?;
    graph.connect(graph.stream_ref(channels[0], "data")?, fft, "din")?;
    Ok(graph)
}

fn print_scalars(graph: &FilterGraph) {
    for (id, node) in graph.iter() {
        let core = node.core();
        for stream in core.streams() {
            if stream.stream_type != StreamType::AnalogScalar {
                continue;
            }
            let text = stream
                .value()
                .map(|v| stream.y_unit.pretty_print(v, 4, true))
                .unwrap_or_else(|| "-".to_string());
            println!("{:>4} {}/{}: {}", id.0, core.display_name, stream.name, text);
        }
        for error in core.errors() {
            println!("{:>4} {}: error: {}", id.0, core.display_name, error);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    let config_path = args.config.clone().or_else(default_config_path);
    let config = match &config_path {
        Some(path) if path.exists() => EngineConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        _ => EngineConfig::default(),
    };
    let _log_guard = logging::init(&config.logging);
    config.apply_pools();

    tracing::info!("Starting scopeflow");

    let mut graph = match &args.graph {
        Some(path) => {
            let doc = GraphDocument::load(path)?;
            let registry = scopeflow::FilterRegistry::global();
            let drivers = scopeflow::InstrumentFactory::with_builtins();
            for warning in doc.preflight(registry, &drivers) {
                tracing::warn!("{}", warning);
            }
            let loaded = doc.build(registry, &drivers, &config.acquisition)?;
            for warning in &loaded.warnings {
                tracing::warn!("{}", warning);
            }
            loaded.graph
        }
        None => demo_graph(&config)?,
    };

    if let Some(path) = &args.save {
        serialize::save_graph(&graph, path).with_context(|| format!("saving {}", path.display()))?;
    }

    let mut workers = Vec::new();
    for handle in graph.instruments() {
        handle.acquisition.start()?;
        workers.push(AcquisitionWorker::from_config(handle.acquisition.clone(), &config.acquisition)?);
    }

    let mut scheduler = Scheduler::new(ComputeContext::from_config(&config.compute), config.scheduler.clone());
    let cycles = args.cycles.unwrap_or(3);
    let period = Duration::from_secs_f64(1.0 / f64::from(config.scheduler.refresh_rate_hz.max(1)));
    for cycle in 0..cycles {
        for handle in graph.instruments() {
            if !handle.acquisition.wait_for_trigger(Duration::from_secs(1)) {
                tracing::warn!("No trigger from '{}' this cycle", handle.name);
            }
        }
        let stats = scheduler.refresh(&mut graph);
        println!(
            "cycle {}: {} refreshed, {} skipped, {} errors, {} us",
            cycle, stats.refreshed, stats.skipped, stats.errors, stats.elapsed_us
        );
        print_scalars(&graph);
        std::thread::sleep(period);
    }

    for handle in graph.instruments() {
        handle.acquisition.stop()?;
    }
    for mut worker in workers {
        worker.stop();
    }
    Ok(())
}
