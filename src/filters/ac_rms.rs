//! AC RMS with a per-cycle trend.
//!
//! The DC bias is the Kahan-summed mean. The scalar output is the RMS of the
//! residual over the whole record; the trend has one point per full cycle,
//! computed over the samples strictly between crossings two apart.

use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, Filter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::util::{kahan_mean, KahanSum};
use crate::waveform::edges::find_zero_crossings;
use crate::waveform::{AnalogView, SparseWaveform};

pub const NAME: &str = "AC RMS";

/// Stream indices
pub const STREAM_TREND: usize = 0;
pub const STREAM_RMS: usize = 1;

/// Result of one AC RMS pass
#[derive(Debug)]
pub struct AcRmsMeasurement {
    pub dc_bias: f64,
    pub rms: f64,
    /// One sample per cycle, X in femtoseconds
    pub trend: SparseWaveform<f32>,
}

/// First index whose scaled offset is strictly greater than `x`
fn first_after(view: &AnalogView<'_>, x: i64) -> usize {
    let (mut lo, mut hi) = (0usize, view.len());
    while lo < hi {
        let mid = (lo + hi) / 2;
        if view.offset_scaled(mid) <= x {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Measure the AC RMS of `view`
pub fn measure(view: AnalogView<'_>) -> Result<AcRmsMeasurement> {
    let samples = view.samples();
    if samples.is_empty() {
        return Err(ScopeError::InvalidInput("waveform has no samples".to_string()));
    }

    let dc_bias = kahan_mean(samples);
    let mut squares = KahanSum::new();
    for &s in samples {
        let d = s as f64 - dc_bias;
        squares.add(d * d);
    }
    let rms = (squares.sum() / samples.len() as f64).sqrt();

    let mut trend = SparseWaveform::new(1);
    trend.header.copy_timebase_from(view.header());
    trend.header.timescale = 1;
    trend.header.trigger_phase = 0;

    let crossings = find_zero_crossings(view, dc_bias as f32);
    let mut k = 0;
    while k + 2 < crossings.len() {
        let (start, end) = (crossings[k], crossings[k + 2]);
        let first = first_after(&view, start);
        let mut acc = KahanSum::new();
        let mut count = 0usize;
        for i in first..samples.len() {
            if view.offset_scaled(i) >= end {
                break;
            }
            let d = samples[i] as f64 - dc_bias;
            acc.add(d * d);
            count += 1;
        }
        if count > 0 {
            trend.push(start, (end - start).max(1), (acc.sum() / count as f64).sqrt() as f32);
        }
        k += 2;
    }

    Ok(AcRmsMeasurement { dc_bias, rms, trend })
}

#[derive(Debug)]
pub struct AcRmsFilter {
    core: NodeCore,
}

impl AcRmsFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::analog("trend", Unit::Volts));
        core.add_stream(Stream::scalar("rms", Unit::Volts));
        Self { core }
    }
}

impl Filter for AcRmsFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_analog_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let y_unit = ctx.input(0).map(|s| s.y_unit).unwrap_or(Unit::Volts);
        let m = measure(ctx.analog_input(0)?)?;

        tracing::debug!(
            "{} rms {:.6} over {} cycles",
            self.core.id(),
            m.rms,
            m.trend.len()
        );
        for stream in self.core.streams_mut() {
            stream.y_unit = y_unit;
        }
        let mut trend = m.trend;
        trend.mark_modified_from_cpu();
        self.core.set_output_waveform(STREAM_TREND, trend.into());
        self.core.set_output_value(STREAM_RMS, m.rms);
        Ok(())
    }
}
