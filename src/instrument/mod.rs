//! Instrument collaborators: the driver trait, channels and acquisition.
//!
//! A driver implements [`Instrument`]. The graph owns one
//! [`InstrumentChannel`] node per driver channel; channel setters forward to
//! the driver so its cache and the hardware stay consistent. Acquisition runs
//! through an [`AcquisitionController`], optionally on an
//! [`AcquisitionWorker`] thread, and reaches the graph only through the
//! controller's pending-waveform queue.
//!
//! All trait methods take `&self`; drivers keep mutable state behind their
//! own mutex so the trait object can be shared as `Arc<dyn Instrument>`.

mod acquisition;
mod channel;
pub mod demo;
mod factory;
pub mod transport;
mod trigger;

pub use acquisition::{AcquisitionController, AcquisitionState, AcquisitionWorker};
pub use channel::InstrumentChannel;
pub use demo::DemoOscilloscope;
pub use factory::{InstrumentConstructor, InstrumentFactory};
pub use transport::{CommandQueue, LoopbackTransport, ScpiLink, Transport};
pub use trigger::{EdgeSlope, TriggerSettings, TriggerType};

use crate::error::{Result, ScopeError};
use crate::units::Unit;
use crate::waveform::Waveform;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One captured acquisition: `(channel, stream)` → waveform
pub type WaveformSet = BTreeMap<(usize, usize), Waveform>;

/// Input coupling of an analog channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coupling {
    Dc1M,
    Ac1M,
    Dc50,
    Gnd,
    /// Generated in software; no front end
    Synthetic,
}

impl Coupling {
    pub fn name(&self) -> &'static str {
        match self {
            Coupling::Dc1M => "DC 1M",
            Coupling::Ac1M => "AC 1M",
            Coupling::Dc50 => "DC 50",
            Coupling::Gnd => "GND",
            Coupling::Synthetic => "synthetic",
        }
    }
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    Analog,
    Digital,
}

/// Static description of one driver channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub kind: ChannelKind,
    /// Output stream names, in order
    pub streams: Vec<String>,
    pub y_unit: Unit,
    pub color: String,
}

impl ChannelInfo {
    pub fn analog(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Analog,
            streams: vec!["data".to_string()],
            y_unit: Unit::Volts,
            color: color.into(),
        }
    }

    pub fn digital(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ChannelKind::Digital,
            streams: vec!["data".to_string()],
            y_unit: Unit::Unitless,
            color: color.into(),
        }
    }
}

/// Trigger status reported by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Armed and free-running
    Run,
    Stop,
    /// A trigger fired; data can be fetched
    Triggered,
    /// Armed, waiting for a trigger event
    Wait,
    Auto,
}

/// How the instrument is reached
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportDescriptor {
    pub name: String,
    pub connection_string: String,
}

fn unsupported<T>(what: &str) -> Result<T> {
    Err(ScopeError::Unsupported(format!("{} is not supported by this instrument", what)))
}

/// Driver surface implemented by every instrument
pub trait Instrument: Send + Sync {
    // ── Identity ──

    fn name(&self) -> String;

    /// Driver name used by serialization to recreate the instrument
    fn driver_name(&self) -> String;

    fn transport(&self) -> TransportDescriptor;

    // ── Channels ──

    fn channel_count(&self) -> usize;

    fn channel_info(&self, i: usize) -> ChannelInfo;

    fn available_couplings(&self, _i: usize) -> Vec<Coupling> {
        vec![Coupling::Dc1M, Coupling::Ac1M, Coupling::Dc50, Coupling::Gnd]
    }

    fn coupling(&self, i: usize) -> Coupling;

    fn set_coupling(&self, i: usize, coupling: Coupling) -> Result<()>;

    fn attenuation(&self, _i: usize) -> f64 {
        1.0
    }

    fn set_attenuation(&self, _i: usize, _attenuation: f64) -> Result<()> {
        unsupported("attenuation")
    }

    /// Bandwidth limit in MHz, 0 for full bandwidth
    fn bandwidth_limit(&self, _i: usize) -> u32 {
        0
    }

    fn set_bandwidth_limit(&self, _i: usize, _mhz: u32) -> Result<()> {
        unsupported("bandwidth limiting")
    }

    /// Full-scale range in volts of one stream
    fn voltage_range(&self, i: usize, stream: usize) -> f64;

    fn set_voltage_range(&self, i: usize, stream: usize, range: f64) -> Result<()>;

    fn offset(&self, i: usize, stream: usize) -> f64;

    fn set_offset(&self, i: usize, stream: usize, offset: f64) -> Result<()>;

    fn is_channel_enabled(&self, _i: usize) -> bool {
        true
    }

    fn set_channel_enabled(&self, _i: usize, _enabled: bool) -> Result<()> {
        unsupported("channel enable")
    }

    fn is_inverted(&self, _i: usize) -> bool {
        false
    }

    fn set_inverted(&self, _i: usize, _invert: bool) -> Result<()> {
        unsupported("inversion")
    }

    fn can_auto_zero(&self, _i: usize) -> bool {
        false
    }

    fn auto_zero(&self, _i: usize) -> Result<()> {
        unsupported("auto-zero")
    }

    fn input_mux_names(&self, _i: usize) -> Vec<String> {
        Vec::new()
    }

    fn input_mux(&self, _i: usize) -> usize {
        0
    }

    fn set_input_mux(&self, _i: usize, _mux: usize) -> Result<()> {
        unsupported("input mux")
    }

    fn digital_threshold(&self, _i: usize) -> f64 {
        0.0
    }

    fn set_digital_threshold(&self, _i: usize, _volts: f64) -> Result<()> {
        unsupported("digital threshold")
    }

    fn digital_hysteresis(&self, _i: usize) -> f64 {
        0.0
    }

    fn set_digital_hysteresis(&self, _i: usize, _volts: f64) -> Result<()> {
        unsupported("digital hysteresis")
    }

    fn adc_mode_names(&self, _i: usize) -> Vec<String> {
        Vec::new()
    }

    fn adc_mode(&self, _i: usize) -> usize {
        0
    }

    fn set_adc_mode(&self, _i: usize, _mode: usize) -> Result<()> {
        unsupported("ADC mode")
    }

    // ── Acquisition ──

    fn start(&self) -> Result<()>;

    fn start_single_trigger(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn force_trigger(&self) -> Result<()>;

    fn poll_trigger(&self) -> Result<TriggerMode>;

    /// Fetch the captured waveforms of the last trigger
    fn acquire_data(&self) -> Result<WaveformSet>;

    fn is_trigger_armed(&self) -> bool;

    // ── Timebase ──

    fn sample_rates_non_interleaved(&self) -> Vec<u64> {
        vec![self.sample_rate()]
    }

    fn sample_rates_interleaved(&self) -> Vec<u64> {
        Vec::new()
    }

    fn sample_depths_non_interleaved(&self) -> Vec<u64> {
        vec![self.sample_depth()]
    }

    fn sample_depths_interleaved(&self) -> Vec<u64> {
        Vec::new()
    }

    /// Samples per second
    fn sample_rate(&self) -> u64;

    fn set_sample_rate(&self, rate: u64) -> Result<()>;

    fn sample_depth(&self) -> u64;

    fn set_sample_depth(&self, depth: u64) -> Result<()>;

    fn is_interleaving(&self) -> bool {
        false
    }

    /// Returns the interleave state actually applied
    fn set_interleaving(&self, _interleave: bool) -> Result<bool> {
        Ok(false)
    }

    /// Channel pairs that cannot both be enabled while interleaving
    fn interleave_conflicts(&self) -> Vec<(usize, usize)> {
        Vec::new()
    }

    fn can_interleave(&self) -> bool {
        !self.sample_rates_interleaved().is_empty()
            && self
                .interleave_conflicts()
                .iter()
                .all(|&(a, b)| !(self.is_channel_enabled(a) && self.is_channel_enabled(b)))
    }

    /// Femtoseconds from the start of the capture to the trigger point
    fn trigger_offset(&self) -> i64 {
        0
    }

    fn set_trigger_offset(&self, _offset_fs: i64) -> Result<()> {
        unsupported("trigger offset")
    }

    fn trigger(&self) -> TriggerSettings {
        TriggerSettings::default()
    }

    fn set_trigger(&self, _trigger: TriggerSettings) -> Result<()> {
        unsupported("trigger configuration")
    }
}

/// An instrument attached to a graph
#[derive(Clone)]
pub struct InstrumentHandle {
    pub name: String,
    pub acquisition: Arc<AcquisitionController>,
    /// Channel node ids, indexed by driver channel
    pub channels: Vec<crate::graph::NodeId>,
}

impl InstrumentHandle {
    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        self.acquisition.instrument()
    }
}

impl fmt::Debug for InstrumentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHandle")
            .field("name", &self.name)
            .field("state", &self.acquisition.state())
            .field("channels", &self.channels)
            .finish()
    }
}
