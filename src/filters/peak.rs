//! Peak-to-peak, maximum and minimum of an analog waveform.

use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, is_frequency_domain, Filter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;

pub const NAME: &str = "Peak";

pub const STREAM_PEAK_TO_PEAK: usize = 0;
pub const STREAM_MAX: usize = 1;
pub const STREAM_MIN: usize = 2;

#[derive(Debug)]
pub struct PeakFilter {
    core: NodeCore,
}

impl PeakFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::scalar("pk-pk", Unit::Volts));
        core.add_stream(Stream::scalar("max", Unit::Volts));
        core.add_stream(Stream::scalar("min", Unit::Volts));
        Self { core }
    }
}

impl Filter for PeakFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && (is_analog_waveform(stream) || is_frequency_domain(stream))
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let y_unit = ctx.input(0).map(|s| s.y_unit).unwrap_or(Unit::Volts);
        let samples = ctx.analog_input(0)?.samples();
        let (min, max) = samples
            .iter()
            .fold(None, |acc: Option<(f32, f32)>, &s| match acc {
                None => Some((s, s)),
                Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
            })
            .ok_or_else(|| ScopeError::InvalidInput("waveform has no samples".to_string()))?;

        for stream in self.core.streams_mut() {
            stream.y_unit = y_unit;
        }
        self.core.set_output_value(STREAM_PEAK_TO_PEAK, (max - min) as f64);
        self.core.set_output_value(STREAM_MAX, max as f64);
        self.core.set_output_value(STREAM_MIN, min as f64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;

    #[test]
    fn test_peak_values() {
        let mut f = PeakFilter::new("#ffffff");
        let input = test_support::analog_stream(vec![0.5, -1.25, 2.0, 0.0], 100);
        test_support::refresh(&mut f, &[&input]).unwrap();
        let value = |i| f.core().stream(i).unwrap().value().unwrap();
        assert_eq!(value(STREAM_PEAK_TO_PEAK), 3.25);
        assert_eq!(value(STREAM_MAX), 2.0);
        assert_eq!(value(STREAM_MIN), -1.25);
    }

    #[test]
    fn test_empty_waveform() {
        let mut f = PeakFilter::new("#ffffff");
        let input = test_support::analog_stream(Vec::new(), 100);
        assert!(matches!(
            test_support::refresh(&mut f, &[&input]),
            Err(ScopeError::InvalidInput(_))
        ));
    }
}
