//! # scopeflow: waveform processing core for oscilloscopes
//!
//! Acquired waveforms flow from instrument channels through a graph of
//! filters (measurements, transforms, protocol decoders, file import and
//! export). Heavy kernels can run on a compute device; every kernel also has
//! a CPU reference path.
//!
//! ## Architecture
//!
//! - **Buffers**: [`buffer::AcceleratedBuffer`] keeps host and device copies coherent
//! - **Waveforms**: [`waveform::Waveform`] is a tagged enum over uniform, sparse and protocol samples
//! - **Graph**: [`graph::FilterGraph`] owns nodes and enforces acyclic wiring
//! - **Scheduler**: [`scheduler::Scheduler`] refreshes nodes in dependency order
//! - **Instruments**: [`instrument::Instrument`] drivers feed channels through an acquisition queue
//! - **Communication**: Crossbeam channels for the scheduler thread and parameter notifications
//!
//! ## Configuration
//!
//! The engine config lives in the platform data directory under
//! `dev.scopeflow`, as TOML or JSON.
//!
//! ## Example
//!
//! ```ignore
//! use scopeflow::{filters, graph::FilterGraph, scheduler::Scheduler};
//!
//! let mut graph = FilterGraph::new();
//! let tone = graph.create_filter(filters::tone::NAME, "#ffff00")?;
//! let rms = graph.create_filter(filters::ac_rms::NAME, "#00ffff")?;
//! graph.connect(graph.stream_ref(tone, "data")?, rms, "din")?;
//!
//! let mut scheduler = Scheduler::cpu_only();
//! scheduler.refresh(&mut graph);
//! let rms_value = graph.node(rms).unwrap().core().stream(1).unwrap().value();
//! ```

pub mod buffer;
pub mod compute;
pub mod config;
pub mod error;
pub mod filters;
pub mod graph;
pub mod instrument;
pub mod logging;
pub mod scheduler;
pub mod serialize;
pub mod units;
pub mod util;
pub mod waveform;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Result, ScopeError};
pub use graph::{Filter, FilterGraph, FilterRegistry, NodeId, ParameterValue, Stream, StreamRef};
pub use instrument::{AcquisitionController, Instrument, InstrumentFactory};
pub use scheduler::{RefreshStats, Scheduler};
pub use serialize::GraphDocument;
pub use units::Unit;
pub use waveform::Waveform;
