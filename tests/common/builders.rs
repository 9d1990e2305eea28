//! Test data builders for graphs and waveform sets

use scopeflow::filters::tone;
use scopeflow::graph::{FilterGraph, NodeId, ParameterValue};
use scopeflow::instrument::WaveformSet;
use scopeflow::waveform::{UniformWaveform, Waveform};

/// Builder for a tone generator node
pub struct ToneBuilder {
    sample_rate: f64,
    frequency: f64,
    amplitude: f64,
    bias: f64,
    depth: i64,
}

impl ToneBuilder {
    pub fn new() -> Self {
        Self {
            sample_rate: 1e9,
            frequency: 1e6,
            amplitude: 1.0,
            bias: 0.0,
            depth: 1024,
        }
    }

    pub fn sample_rate(mut self, hz: f64) -> Self {
        self.sample_rate = hz;
        self
    }

    pub fn frequency(mut self, hz: f64) -> Self {
        self.frequency = hz;
        self
    }

    /// Peak-to-peak amplitude
    pub fn amplitude(mut self, volts: f64) -> Self {
        self.amplitude = volts;
        self
    }

    pub fn bias(mut self, volts: f64) -> Self {
        self.bias = volts;
        self
    }

    pub fn depth(mut self, samples: i64) -> Self {
        self.depth = samples;
        self
    }

    pub fn add_to(self, graph: &mut FilterGraph) -> NodeId {
        let id = graph.create_filter(tone::NAME, "#ffff00").unwrap();
        let params = [
            (tone::PARAM_SAMPLE_RATE, ParameterValue::Float(self.sample_rate)),
            (tone::PARAM_FREQUENCY, ParameterValue::Float(self.frequency)),
            (tone::PARAM_AMPLITUDE, ParameterValue::Float(self.amplitude)),
            (tone::PARAM_BIAS, ParameterValue::Float(self.bias)),
            (tone::PARAM_DEPTH, ParameterValue::Int(self.depth)),
        ];
        for (name, value) in &params {
            graph.set_parameter(id, name, value).unwrap();
        }
        id
    }
}

/// Create a filter and wire `(source node, stream name)` pairs to its inputs in order
pub fn filter_after(graph: &mut FilterGraph, class: &str, sources: &[(NodeId, &str)]) -> NodeId {
    let id = graph.create_filter(class, "#00ffff").unwrap();
    for (slot, &(node, stream)) in sources.iter().enumerate() {
        let src = graph.stream_ref(node, stream).unwrap();
        graph.set_input(id, slot, Some(src)).unwrap();
    }
    id
}

/// One digital waveform per channel, all sharing `timescale`
pub fn digital_set(channels: &[Vec<bool>], timescale: i64) -> WaveformSet {
    channels
        .iter()
        .enumerate()
        .map(|(i, samples)| ((i, 0), Waveform::from(UniformWaveform::from_samples(samples.clone(), timescale))))
        .collect()
}

/// Mode 0 SPI transfer of `bytes`, MSB first, two samples per clock period.
///
/// Returns `[clk, cs, data]`; CS is low for exactly `8 * bytes.len()` clocks.
pub fn spi_transfer(bytes: &[u8]) -> [Vec<bool>; 3] {
    let (mut clk, mut cs, mut data) = (vec![false; 4], vec![true; 4], vec![false; 4]);
    cs[3] = false;
    for &b in bytes {
        for k in 0..8 {
            let bit = (b >> (7 - k)) & 1 == 1;
            clk.extend([false, true]);
            cs.extend([false, false]);
            data.extend([bit, bit]);
        }
    }
    clk.extend([false; 4]);
    cs.extend([false, true, true, true]);
    data.extend([false; 4]);
    [clk, cs, data]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_transfer_shape() {
        let [clk, cs, data] = spi_transfer(&[0xff]);
        assert_eq!(clk.len(), cs.len());
        assert_eq!(cs.len(), data.len());
        assert_eq!(clk.iter().filter(|&&c| c).count(), 8);
    }
}
