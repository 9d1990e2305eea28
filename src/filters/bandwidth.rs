//! Bandwidth at a threshold below a reference level.
//!
//! Input is a magnitude response in dB over frequency. The result is the
//! first frequency (linearly interpolated between bins) at which the
//! response falls below `reference - threshold`.

use crate::error::{Result, ScopeError};
use crate::graph::{is_frequency_domain, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::AnalogView;

pub const NAME: &str = "Bandwidth";

pub const PARAM_REFERENCE: &str = "Reference Level";
pub const PARAM_THRESHOLD: &str = "Threshold";

/// First interpolated X where `view` drops below `level`, if it ever does
pub fn first_below(view: AnalogView<'_>, level: f64) -> Option<f64> {
    let samples = view.samples();
    let first = samples.first()?;
    if (*first as f64) < level {
        return Some(view.offset_scaled(0) as f64);
    }
    for i in 1..samples.len() {
        let (a, b) = (samples[i - 1] as f64, samples[i] as f64);
        if b < level {
            let x0 = view.offset_scaled(i - 1) as f64;
            let x1 = view.offset_scaled(i) as f64;
            let frac = if a == b { 1.0 } else { (a - level) / (a - b) };
            return Some(x0 + frac * (x1 - x0));
        }
    }
    None
}

#[derive(Debug)]
pub struct BandwidthFilter {
    core: NodeCore,
}

impl BandwidthFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::scalar("bandwidth", Unit::Hertz));
        let params = core.parameters_mut();
        params.insert(PARAM_REFERENCE, FilterParameter::float(0.0, Unit::Db));
        params.insert(PARAM_THRESHOLD, FilterParameter::float(3.0, Unit::Db));
        Self { core }
    }
}

impl Filter for BandwidthFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_frequency_domain(stream) && stream.y_unit == Unit::Db
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let reference = self.core.parameters().float(PARAM_REFERENCE);
        let threshold = self.core.parameters().float(PARAM_THRESHOLD);
        let hz_per_unit = ctx
            .input(0)
            .and_then(|s| s.x_unit.hertz_scale())
            .unwrap_or(1.0);
        let view = ctx.analog_input(0)?;
        let level = reference - threshold;
        let bw = first_below(view, level).ok_or_else(|| {
            ScopeError::InvalidInput(format!("response never falls below {} dB", level))
        })?;
        self.core.set_output_value(0, bw * hz_per_unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;
    use crate::graph::StreamType;
    use crate::waveform::UniformWaveform;

    /// Flat to `corner`, then falling 20 dB/decade-ish with exactly -3 dB at `corner`
    fn response(bin_hz: i64, bins: usize, corner: f64) -> Stream {
        let samples = (0..bins)
            .map(|i| {
                let f = i as f64 * bin_hz as f64;
                if f <= corner {
                    -3.0 * (f / corner).powi(8) as f32
                } else {
                    (-3.0 - 20.0 * (f / corner).log10()) as f32
                }
            })
            .collect();
        test_support::spectrum_stream(UniformWaveform::from_samples(samples, bin_hz).into(), Unit::Db)
    }

    #[test]
    fn test_three_db_point() {
        let mut f = BandwidthFilter::new("#ffffff");
        let bin = 1_000_000;
        let input = response(bin, 2000, 500e6);
        test_support::refresh(&mut f, &[&input]).unwrap();
        let bw = f.core().stream(0).unwrap().value().unwrap();
        assert!((bw - 500e6).abs() <= bin as f64, "bandwidth {}", bw);
    }

    #[test]
    fn test_millihertz_axis_reports_hertz() {
        let mut f = BandwidthFilter::new("#ffffff");
        let mut input = response(1_000_000, 2000, 500e6);
        // Same response with the axis stored in millihertz: 1 kHz bins over 2 MHz
        input.x_unit = Unit::Millihertz;
        test_support::refresh(&mut f, &[&input]).unwrap();
        let bw = f.core().stream(0).unwrap().value().unwrap();
        assert!((bw - 500e3).abs() <= 1e3, "bandwidth {}", bw);
    }

    #[test]
    fn test_flat_response_is_an_error() {
        let mut f = BandwidthFilter::new("#ffffff");
        let input = test_support::spectrum_stream(UniformWaveform::from_samples(vec![0.0f32; 64], 10).into(), Unit::Db);
        assert!(test_support::refresh(&mut f, &[&input]).is_err());
    }

    #[test]
    fn test_requires_db_spectrum() {
        let f = BandwidthFilter::new("#ffffff");
        assert!(!f.validate_channel(0, &Stream::analog("t", Unit::Volts)));
        assert!(f.validate_channel(0, &Stream::new("m", StreamType::Analog, Unit::Hertz, Unit::Db)));
    }
}
