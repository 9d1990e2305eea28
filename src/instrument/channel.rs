//! Instrument channel: the leaf node fed by acquisition.

use super::{ChannelInfo, ChannelKind, Coupling, Instrument};
use crate::error::Result;
use crate::graph::{NodeCore, Stream};
use crate::waveform::Waveform;
use std::fmt;
use std::sync::Arc;

/// Class name recorded on every channel node
pub const CHANNEL_CLASS: &str = "Instrument Channel";

/// One driver channel exposed as a graph node.
///
/// Setters forward to the owning instrument; getters read the driver, which
/// may answer from its cache.
pub struct InstrumentChannel {
    core: NodeCore,
    instrument: Arc<dyn Instrument>,
    index: usize,
    info: ChannelInfo,
}

impl InstrumentChannel {
    pub fn new(instrument: Arc<dyn Instrument>, index: usize) -> Self {
        let info = instrument.channel_info(index);
        let mut core = NodeCore::new(CHANNEL_CLASS, info.color.clone());
        core.display_name = info.name.clone();
        for name in &info.streams {
            let stream = match info.kind {
                ChannelKind::Analog => Stream::analog(name.clone(), info.y_unit),
                ChannelKind::Digital => Stream::digital(name.clone()),
            };
            core.add_stream(stream);
        }
        Self {
            core,
            instrument,
            index,
            info,
        }
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut NodeCore {
        &mut self.core
    }

    /// Driver channel index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the channel on the instrument (e.g. "CH1")
    pub fn hardware_name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.info.kind
    }

    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        &self.instrument
    }

    pub fn available_couplings(&self) -> Vec<Coupling> {
        self.instrument.available_couplings(self.index)
    }

    pub fn coupling(&self) -> Coupling {
        self.instrument.coupling(self.index)
    }

    pub fn set_coupling(&self, coupling: Coupling) -> Result<()> {
        self.instrument.set_coupling(self.index, coupling)
    }

    pub fn attenuation(&self) -> f64 {
        self.instrument.attenuation(self.index)
    }

    pub fn set_attenuation(&self, attenuation: f64) -> Result<()> {
        self.instrument.set_attenuation(self.index, attenuation)
    }

    pub fn bandwidth_limit(&self) -> u32 {
        self.instrument.bandwidth_limit(self.index)
    }

    pub fn set_bandwidth_limit(&self, mhz: u32) -> Result<()> {
        self.instrument.set_bandwidth_limit(self.index, mhz)
    }

    pub fn voltage_range(&self, stream: usize) -> f64 {
        self.instrument.voltage_range(self.index, stream)
    }

    pub fn set_voltage_range(&self, stream: usize, range: f64) -> Result<()> {
        self.instrument.set_voltage_range(self.index, stream, range)
    }

    pub fn offset(&self, stream: usize) -> f64 {
        self.instrument.offset(self.index, stream)
    }

    pub fn set_offset(&self, stream: usize, offset: f64) -> Result<()> {
        self.instrument.set_offset(self.index, stream, offset)
    }

    pub fn is_enabled(&self) -> bool {
        self.instrument.is_channel_enabled(self.index)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.instrument.set_channel_enabled(self.index, enabled)
    }

    pub fn is_inverted(&self) -> bool {
        self.instrument.is_inverted(self.index)
    }

    pub fn set_inverted(&self, invert: bool) -> Result<()> {
        self.instrument.set_inverted(self.index, invert)
    }

    pub fn can_auto_zero(&self) -> bool {
        self.instrument.can_auto_zero(self.index)
    }

    pub fn auto_zero(&self) -> Result<()> {
        self.instrument.auto_zero(self.index)
    }

    pub fn input_mux_names(&self) -> Vec<String> {
        self.instrument.input_mux_names(self.index)
    }

    pub fn input_mux(&self) -> usize {
        self.instrument.input_mux(self.index)
    }

    pub fn set_input_mux(&self, mux: usize) -> Result<()> {
        self.instrument.set_input_mux(self.index, mux)
    }

    pub fn digital_threshold(&self) -> f64 {
        self.instrument.digital_threshold(self.index)
    }

    pub fn set_digital_threshold(&self, volts: f64) -> Result<()> {
        self.instrument.set_digital_threshold(self.index, volts)
    }

    pub fn digital_hysteresis(&self) -> f64 {
        self.instrument.digital_hysteresis(self.index)
    }

    pub fn set_digital_hysteresis(&self, volts: f64) -> Result<()> {
        self.instrument.set_digital_hysteresis(self.index, volts)
    }

    pub fn adc_mode(&self) -> usize {
        self.instrument.adc_mode(self.index)
    }

    pub fn set_adc_mode(&self, mode: usize) -> Result<()> {
        self.instrument.set_adc_mode(self.index, mode)
    }

    /// Install one captured set on this channel's streams and bump their revision
    pub(crate) fn accept_waveforms(&mut self, waveforms: Vec<(usize, Waveform)>) {
        self.core.output_revision += 1;
        let revision = self.core.output_revision;
        self.core.clear_errors();
        for (i, waveform) in waveforms {
            match self.core.stream_mut(i) {
                Some(stream) => {
                    stream.set_waveform(Some(waveform));
                    stream.stamp(revision);
                }
                None => tracing::warn!(
                    "Channel '{}' has no stream {}; dropping waveform",
                    self.info.name,
                    i
                ),
            }
        }
    }
}

impl fmt::Debug for InstrumentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentChannel")
            .field("id", &self.core.id())
            .field("name", &self.info.name)
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::DemoOscilloscope;
    use crate::waveform::UniformWaveform;

    #[test]
    fn test_setters_reach_the_instrument() {
        let scope: Arc<dyn Instrument> = Arc::new(DemoOscilloscope::new("demo"));
        let ch = InstrumentChannel::new(scope.clone(), 1);
        assert_eq!(ch.hardware_name(), "CH2");
        ch.set_coupling(Coupling::Ac1M).unwrap();
        ch.set_offset(0, 0.25).unwrap();
        assert_eq!(scope.coupling(1), Coupling::Ac1M);
        assert_eq!(ch.offset(0), 0.25);
    }

    #[test]
    fn test_accept_waveforms_bumps_revision() {
        let scope: Arc<dyn Instrument> = Arc::new(DemoOscilloscope::new("demo"));
        let mut ch = InstrumentChannel::new(scope, 0);
        ch.accept_waveforms(vec![(0, UniformWaveform::from_samples(vec![0.0f32; 4], 1000).into())]);
        let first = ch.core().stream(0).unwrap().revision().unwrap();
        ch.accept_waveforms(vec![(0, UniformWaveform::from_samples(vec![0.0f32; 4], 1000).into())]);
        assert_eq!(ch.core().stream(0).unwrap().revision(), Some(first + 1));
    }
}
