//! Time-window crop.
//!
//! Uniform inputs are resampled on the input grid starting at the window
//! start, interpolating linearly between neighbours unless the source stream
//! is flagged `DO_NOT_INTERPOLATE`, in which case the preceding sample is
//! held. Sparse inputs keep every sample overlapping the window, clipped to
//! its edges.

use crate::buffer::AcceleratedBuffer;
use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, Filter, FilterParameter, NodeCore, RefreshContext, Stream, StreamFlags};
use crate::units::Unit;
use crate::waveform::{AnalogView, SparseWaveform, UniformWaveform, Waveform};

pub const NAME: &str = "Window";

pub const PARAM_START: &str = "Start Time";
pub const PARAM_END: &str = "End Time";

#[derive(Debug)]
pub struct WindowFilter {
    core: NodeCore,
}

impl WindowFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::analog("data", Unit::Volts));
        let params = core.parameters_mut();
        params.insert(PARAM_START, FilterParameter::int(0, Unit::Femtoseconds));
        params.insert(PARAM_END, FilterParameter::int(1_000_000_000_000, Unit::Femtoseconds));
        Self { core }
    }
}

/// Crop a uniform waveform to `[start, end]`
pub fn crop_uniform(src: &UniformWaveform<f32>, start: i64, end: i64, interpolate: bool) -> UniformWaveform<f32> {
    let ts = src.header.timescale.max(1);
    let phase = src.header.trigger_phase;
    let samples = src.samples.as_slice();
    let n = samples.len();

    let mut out = UniformWaveform::new(ts);
    out.header.copy_timebase_from(&src.header);
    if n == 0 {
        return out;
    }

    let first_x = phase;
    let last_x = phase + (n as i64 - 1) * ts;
    let t0 = start.max(first_x);
    out.header.trigger_phase = t0;

    let mut values = Vec::new();
    let mut t = t0;
    while t <= end && t <= last_x {
        let pos = (t - phase) as f64 / ts as f64;
        let i = (pos.floor() as usize).min(n - 1);
        let frac = pos - i as f64;
        let v = if interpolate && i + 1 < n && frac > 0.0 {
            let (a, b) = (samples[i] as f64, samples[i + 1] as f64);
            (a + (b - a) * frac) as f32
        } else {
            samples[i]
        };
        values.push(v);
        t += ts;
    }
    out.samples = AcceleratedBuffer::from_vec(values);
    out.mark_modified_from_cpu();
    out
}

/// Keep the samples of `src` that overlap `[start, end]`, clipped to it
pub fn crop_sparse(src: AnalogView<'_>, start: i64, end: i64) -> SparseWaveform<f32> {
    let mut out = SparseWaveform::new(1);
    out.header.copy_timebase_from(src.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;
    for i in 0..src.len() {
        let x0 = src.offset_scaled(i);
        let x1 = x0 + src.duration_scaled(i);
        if x1 <= start || x0 > end {
            continue;
        }
        let a = x0.max(start);
        let b = x1.min(end + 1);
        out.push(a, (b - a).max(1), src.value(i));
    }
    out.mark_modified_from_cpu();
    out
}

impl Filter for WindowFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_analog_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let start = self.core.parameters().int(PARAM_START);
        let end = self.core.parameters().int(PARAM_END);
        if end <= start {
            return Err(ScopeError::InvalidParameter(format!(
                "window end {} is not after start {}",
                end, start
            )));
        }

        let (flags, y_unit) = ctx
            .input(0)
            .map(|s| (s.flags, s.y_unit))
            .unwrap_or((StreamFlags::default(), Unit::Volts));
        let interpolate = !flags.contains(StreamFlags::DO_NOT_INTERPOLATE);

        let out: Waveform = match ctx.input_waveform(0)? {
            Waveform::UniformAnalog(w) => crop_uniform(w, start, end, interpolate).into(),
            other => {
                let view = other
                    .analog()
                    .ok_or_else(|| ScopeError::InvalidInput("din is not an analog waveform".to_string()))?;
                crop_sparse(view, start, end).into()
            }
        };

        let stream = &mut self.core.streams_mut()[0];
        stream.flags = flags;
        stream.y_unit = y_unit;
        self.core.set_output_waveform(0, out);
        Ok(())
    }
}
