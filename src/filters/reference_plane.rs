//! Reference plane extension over an S-parameter set.
//!
//! Each port gets an additive time shift in femtoseconds. For `S{to}{from}`
//! the shifts of both ports add, and the angle at frequency `f` is rotated by
//! `-(shift_fs / period_fs) * 360°`. Magnitudes pass through unchanged.
//! Angles are not re-wrapped, so a full turn reads as -360°.

use crate::error::{Result, ScopeError};
use crate::graph::{is_frequency_domain, Filter, FilterParameter, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::{AnalogView, SparseWaveform, FS_PER_SECOND};

use super::touchstone::{sparameter_streams, stream_names};

pub const NAME: &str = "Reference Plane Extension";

pub const PARAM_PORTS: &str = "Ports";

const MAX_PORTS: i64 = 9;

pub fn port_shift_param(port: usize) -> String {
    format!("Port {} Shift", port)
}

/// Rotate an angle response by `shift_fs` of extra delay
pub fn rotate(angle: AnalogView<'_>, shift_fs: f64) -> SparseWaveform<f32> {
    let mut out = SparseWaveform::new(1);
    out.header.copy_timebase_from(angle.header());
    out.header.timescale = 1;
    out.header.trigger_phase = 0;
    for i in 0..angle.len() {
        let f = angle.offset_scaled(i);
        let turns = shift_fs * f as f64 / FS_PER_SECOND as f64;
        let degrees = angle.value(i) as f64 - 360.0 * turns;
        out.push(f, angle.duration_scaled(i), degrees as f32);
    }
    out.mark_modified_from_cpu();
    out
}

#[derive(Debug)]
pub struct ReferencePlaneFilter {
    core: NodeCore,
    ports: usize,
}

impl ReferencePlaneFilter {
    pub fn new(color: &str) -> Self {
        let mut f = Self {
            core: NodeCore::new(NAME, color),
            ports: 0,
        };
        f.core
            .parameters_mut()
            .insert(PARAM_PORTS, FilterParameter::int(2, Unit::Unitless));
        f.reconfigure();
        f
    }

    pub fn port_count(&self) -> usize {
        self.ports
    }

    /// Port pairs in slot order; slot `2k` is magnitude, `2k + 1` angle
    fn pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        let n = self.ports;
        (1..=n).flat_map(move |to| (1..=n).map(move |from| (to, from)))
    }

    fn reconfigure(&mut self) {
        let requested = self.core.parameters().int(PARAM_PORTS);
        let n = requested.clamp(1, MAX_PORTS) as usize;
        if n as i64 != requested {
            tracing::warn!("{} port count {} clamped to {}", self.core.id(), requested, n);
        }
        self.ports = n;

        for port in 1..=n {
            let name = port_shift_param(port);
            if !self.core.parameters().contains(&name) {
                self.core
                    .parameters_mut()
                    .insert(name, FilterParameter::float(0.0, Unit::Femtoseconds));
            }
        }

        let pairs: Vec<(usize, usize)> = self.pairs().collect();
        let inputs = pairs.iter().flat_map(|&(to, from)| {
            let (mag, ang) = stream_names(to, from);
            [mag, ang]
        });
        self.core.rebuild_inputs(inputs);
        let streams = pairs
            .iter()
            .flat_map(|&(to, from)| sparameter_streams(to, from))
            .collect();
        self.core.rebuild_streams(streams);
    }

    fn shift(&self, port: usize) -> f64 {
        self.core.parameters().float(&port_shift_param(port))
    }
}

impl Filter for ReferencePlaneFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        let expected = if i % 2 == 0 { Unit::Db } else { Unit::Degrees };
        i < self.core.input_count() && is_frequency_domain(stream) && stream.y_unit == expected
    }

    fn on_parameter_changed(&mut self, name: &str) {
        if name == PARAM_PORTS {
            self.reconfigure();
        }
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let pairs: Vec<(usize, usize)> = self.pairs().collect();
        let mut outputs = Vec::with_capacity(pairs.len() * 2);
        for (k, &(to, from)) in pairs.iter().enumerate() {
            let mag = ctx.input_waveform(2 * k)?.try_clone()?;
            let angle = ctx.analog_input(2 * k + 1)?;
            let shift = self.shift(to) + self.shift(from);
            if !shift.is_finite() {
                return Err(ScopeError::InvalidParameter(format!(
                    "non-finite shift on S{}{}",
                    to, from
                )));
            }
            outputs.push(mag);
            outputs.push(rotate(angle, shift).into());
        }
        for (i, w) in outputs.into_iter().enumerate() {
            self.core.set_output_waveform(i, w);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_support;
    use crate::graph::StreamType;
    use crate::waveform::Waveform;

    fn sparse(points: &[(i64, f32)]) -> Waveform {
        let mut w = SparseWaveform::new(1);
        for &(f, v) in points {
            w.push(f, 1_000_000, v);
        }
        w.into()
    }

    fn two_port_inputs(angle: f32) -> Vec<Stream> {
        let mut streams = Vec::new();
        for to in 1..=2 {
            for from in 1..=2 {
                let [mut mag, mut ang] = sparameter_streams(to, from);
                mag.set_waveform(Some(sparse(&[(1_000_000_000, -1.0), (10_000_000_000, -3.0)])));
                ang.set_waveform(Some(sparse(&[(1_000_000_000, angle), (10_000_000_000, angle)])));
                streams.push(mag);
                streams.push(ang);
            }
        }
        streams
    }

    fn output_angle(f: &ReferencePlaneFilter, name: &str, i: usize) -> f32 {
        let idx = f.core().stream_index(name).unwrap();
        f.core().stream(idx).unwrap().waveform().unwrap().analog().unwrap().value(i)
    }

    #[test]
    fn test_default_layout() {
        let f = ReferencePlaneFilter::new("#ffffff");
        assert_eq!(f.port_count(), 2);
        assert_eq!(f.core().input_count(), 8);
        assert_eq!(f.core().input_name(3), Some("S12_ang"));
        assert_eq!(f.core().stream(2).unwrap().name, "S12_mag");
        assert!(f.core().parameters().contains("Port 2 Shift"));
    }

    #[test]
    fn test_hundred_picoseconds_at_ten_gigahertz() {
        let mut f = ReferencePlaneFilter::new("#ffffff");
        f.core_mut().parameters_mut().set_float("Port 1 Shift", 100_000.0).unwrap();
        let inputs = two_port_inputs(0.0);
        let refs: Vec<&Stream> = inputs.iter().collect();
        test_support::refresh(&mut f, &refs).unwrap();

        // S21 sees port 1 only; S11 sees it twice
        assert!((output_angle(&f, "S21_ang", 1) + 360.0).abs() < 1e-3);
        assert!((output_angle(&f, "S21_ang", 0) + 36.0).abs() < 1e-3);
        assert!((output_angle(&f, "S11_ang", 1) + 720.0).abs() < 1e-3);
        assert_eq!(output_angle(&f, "S22_ang", 1), 0.0);
        assert_eq!(output_angle(&f, "S21_mag", 1), -3.0);
    }

    #[test]
    fn test_zero_shift_is_exact() {
        let mut f = ReferencePlaneFilter::new("#ffffff");
        let inputs = two_port_inputs(-123.456);
        let refs: Vec<&Stream> = inputs.iter().collect();
        test_support::refresh(&mut f, &refs).unwrap();
        assert_eq!(output_angle(&f, "S21_ang", 0), -123.456);
        assert_eq!(output_angle(&f, "S12_ang", 1), -123.456);
    }

    #[test]
    fn test_port_count_change_rebuilds_slots() {
        let mut f = ReferencePlaneFilter::new("#ffffff");
        f.core_mut().parameters_mut().set_int(PARAM_PORTS, 3).unwrap();
        f.on_parameter_changed(PARAM_PORTS);
        assert_eq!(f.core().input_count(), 18);
        assert_eq!(f.core().stream_count(), 18);
        assert!(f.core().parameters().contains("Port 3 Shift"));
    }

    #[test]
    fn test_validate_units() {
        let f = ReferencePlaneFilter::new("#ffffff");
        let [mag, ang] = sparameter_streams(2, 1);
        assert!(f.validate_channel(0, &mag));
        assert!(!f.validate_channel(0, &ang));
        assert!(f.validate_channel(1, &ang));
        let time = Stream::new("t", StreamType::Analog, Unit::Femtoseconds, Unit::Degrees);
        assert!(!f.validate_channel(1, &time));
    }
}
