//! Group delay from a phase response.
//!
//! Consecutive phase points are unwrapped into a ±180° window before the
//! finite difference `delay = -Δφ / (2π Δf)`. Output is in femtoseconds over
//! the input's frequency axis, one point per input pair.

use crate::error::{Result, ScopeError};
use crate::graph::{is_frequency_domain, Filter, NodeCore, RefreshContext, Stream, StreamType};
use crate::units::Unit;
use crate::waveform::{AnalogView, SparseWaveform, FS_PER_SECOND};

pub const NAME: &str = "Group Delay";

/// Difference `hi - lo` in degrees, wrapped into `[-180, 180]`
pub fn unwrapped_difference(lo: f64, hi: f64) -> f64 {
    let mut d = hi - lo;
    while d > 180.0 {
        d -= 360.0;
    }
    while d < -180.0 {
        d += 360.0;
    }
    d
}

/// Group delay of a phase response in degrees over a frequency axis of
/// `hz_per_unit` hertz per offset unit
pub fn group_delay(phase: AnalogView<'_>, hz_per_unit: f64) -> Result<SparseWaveform<f32>> {
    if phase.len() < 2 {
        return Err(ScopeError::InvalidInput(
            "group delay needs at least two phase points".to_string(),
        ));
    }
    let mut out = SparseWaveform::new(1);
    out.header.copy_timebase_from(phase.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;

    for i in 0..phase.len() - 1 {
        let f_lo = phase.offset_scaled(i);
        let f_hi = phase.offset_scaled(i + 1);
        let df = (f_hi - f_lo) as f64 * hz_per_unit;
        if df <= 0.0 {
            continue;
        }
        let dphi = unwrapped_difference(phase.value(i) as f64, phase.value(i + 1) as f64).to_radians();
        let seconds = -dphi / (2.0 * std::f64::consts::PI * df);
        out.push(f_lo, f_hi - f_lo, (seconds * FS_PER_SECOND as f64) as f32);
    }
    out.mark_modified_from_cpu();
    Ok(out)
}

#[derive(Debug)]
pub struct GroupDelayFilter {
    core: NodeCore,
}

impl GroupDelayFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("phase");
        core.add_stream(Stream::new("delay", StreamType::Analog, Unit::Hertz, Unit::Femtoseconds));
        Self { core }
    }
}

impl Filter for GroupDelayFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_frequency_domain(stream) && stream.y_unit == Unit::Degrees
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let x_unit = ctx.input(0).map(|s| s.x_unit).unwrap_or(Unit::Hertz);
        let out = group_delay(ctx.analog_input(0)?, x_unit.hertz_scale().unwrap_or(1.0))?;
        if let Some(stream) = self.core.stream_mut(0) {
            stream.x_unit = x_unit;
        }
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}
