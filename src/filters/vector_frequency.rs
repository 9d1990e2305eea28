//! Instantaneous frequency from I/Q.

use crate::buffer::AcceleratedBuffer;
use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, Filter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::{UniformWaveform, Waveform, FS_PER_SECOND};
use std::f64::consts::PI;

pub const NAME: &str = "Vector Frequency";

#[derive(Debug)]
pub struct VectorFrequencyFilter {
    core: NodeCore,
}

impl VectorFrequencyFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("I");
        core.create_input("Q");
        core.add_stream(Stream::analog("frequency", Unit::Hertz));
        Self { core }
    }
}

/// Frequency in Hz between consecutive I/Q points `timescale` fs apart
pub fn instantaneous_frequency(i: &[f32], q: &[f32], timescale: i64) -> Vec<f32> {
    let n = i.len().min(q.len());
    let dt = timescale as f64 / FS_PER_SECOND as f64;
    let mut out = Vec::with_capacity(n.saturating_sub(1));
    let mut prev = (q.first().copied().unwrap_or(0.0) as f64).atan2(i.first().copied().unwrap_or(0.0) as f64);
    for k in 1..n {
        let phase = (q[k] as f64).atan2(i[k] as f64);
        let mut d = phase - prev;
        if d > PI {
            d -= 2.0 * PI;
        } else if d <= -PI {
            d += 2.0 * PI;
        }
        out.push((d / (2.0 * PI * dt)) as f32);
        prev = phase;
    }
    out
}

impl Filter for VectorFrequencyFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i < 2 && is_analog_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let (wi, wq) = match (ctx.input_waveform(0)?, ctx.input_waveform(1)?) {
            (Waveform::UniformAnalog(a), Waveform::UniformAnalog(b)) => (a, b),
            _ => {
                return Err(ScopeError::InvalidInput(
                    "I and Q must be uniformly sampled analog waveforms".to_string(),
                ))
            }
        };
        if wi.header.timescale != wq.header.timescale {
            return Err(ScopeError::InvalidInput(format!(
                "I and Q sample intervals differ ({} vs {} fs)",
                wi.header.timescale, wq.header.timescale
            )));
        }

        let freq = instantaneous_frequency(wi.samples.as_slice(), wq.samples.as_slice(), wi.header.timescale);
        let mut out = UniformWaveform::new(wi.header.timescale);
        out.header.copy_timebase_from(&wi.header);
        out.samples = AcceleratedBuffer::from_vec(freq);
        out.mark_modified_from_cpu();
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;

    #[test]
    fn test_rotating_phasor() {
        let fs = 1e9;
        let f = -12.5e6;
        let (i, q): (Vec<f32>, Vec<f32>) = (0..500)
            .map(|k| {
                let ph = 2.0 * PI * f * k as f64 / fs;
                (ph.cos() as f32, ph.sin() as f32)
            })
            .unzip();
        let out = instantaneous_frequency(&i, &q, 1_000_000);
        assert_eq!(out.len(), 499);
        for v in out {
            assert!((v as f64 - f).abs() < 1e5, "got {}", v);
        }
    }

    #[test]
    fn test_mismatched_timescales() {
        let mut filter = VectorFrequencyFilter::new("#ffffff");
        let i = test_support::analog_stream(vec![1.0; 8], 1000);
        let q = test_support::analog_stream(vec![0.0; 8], 2000);
        assert!(matches!(
            test_support::refresh(&mut filter, &[&i, &q]),
            Err(ScopeError::InvalidInput(_))
        ));
    }
}
