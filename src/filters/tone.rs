//! Sinusoidal tone generator.
//!
//! `s_i = bias + (amplitude / 2) * sin(i * 2π f / f_s + φ0)` for `i < depth`,
//! uniform with `timescale = 10^15 / f_s`. Runs the `tone` kernel when the
//! device has 64-bit floats, the single-precision `tone-f32` kernel on other
//! devices, and the CPU loop below without a device.

use crate::buffer::AcceleratedBuffer;
use crate::compute::kernels::{PushConstants, ToneTurnsPush, TonePush, TONE, TONE_F32};
use crate::compute::ComputePipeline;
use crate::error::{Result, ScopeError};
use crate::graph::{Filter, FilterParameter, InputLocation, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::{timescale_for_rate, UniformWaveform};
use std::f64::consts::PI;

pub const NAME: &str = "Tone";

pub const PARAM_SAMPLE_RATE: &str = "Sample Rate";
pub const PARAM_FREQUENCY: &str = "Frequency";
pub const PARAM_AMPLITUDE: &str = "Amplitude";
pub const PARAM_BIAS: &str = "Bias";
pub const PARAM_START_PHASE: &str = "Start Phase";
pub const PARAM_DEPTH: &str = "Depth";

#[derive(Debug)]
pub struct ToneFilter {
    core: NodeCore,
}

/// Resolved generator settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSettings {
    pub sample_rate: f64,
    pub frequency: f64,
    /// Peak-to-peak
    pub amplitude: f64,
    pub bias: f64,
    /// Radians
    pub start_phase: f64,
    pub depth: usize,
}

impl ToneSettings {
    pub fn radians_per_sample(&self) -> f64 {
        2.0 * PI * self.frequency / self.sample_rate
    }

    /// Reference CPU implementation
    pub fn generate(&self) -> Vec<f32> {
        let rps = self.radians_per_sample();
        let half = self.amplitude / 2.0;
        (0..self.depth)
            .map(|i| (self.bias + half * (i as f64 * rps + self.start_phase).sin()) as f32)
            .collect()
    }
}

impl ToneFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.add_stream(Stream::analog("data", Unit::Volts));

        let params = core.parameters_mut();
        params.insert(PARAM_SAMPLE_RATE, FilterParameter::float(1e9, Unit::SampleRate));
        params.insert(PARAM_FREQUENCY, FilterParameter::float(1e6, Unit::Hertz));
        params.insert(PARAM_AMPLITUDE, FilterParameter::float(1.0, Unit::Volts));
        params.insert(PARAM_BIAS, FilterParameter::float(0.0, Unit::Volts));
        params.insert(PARAM_START_PHASE, FilterParameter::float(0.0, Unit::Degrees));
        params.insert(PARAM_DEPTH, FilterParameter::int(100_000, Unit::SampleDepth));

        Self { core }
    }

    pub fn settings(&self) -> Result<ToneSettings> {
        let p = self.core.parameters();
        let settings = ToneSettings {
            sample_rate: p.float(PARAM_SAMPLE_RATE),
            frequency: p.float(PARAM_FREQUENCY),
            amplitude: p.float(PARAM_AMPLITUDE),
            bias: p.float(PARAM_BIAS),
            start_phase: p.float(PARAM_START_PHASE).to_radians(),
            depth: p.int(PARAM_DEPTH).max(0) as usize,
        };
        if settings.sample_rate.is_nan() || settings.sample_rate <= 0.0 {
            return Err(ScopeError::InvalidParameter(format!(
                "sample rate must be positive, got {}",
                settings.sample_rate
            )));
        }
        if settings.depth == 0 {
            return Err(ScopeError::InvalidParameter("depth must be at least one sample".to_string()));
        }
        if settings.depth > u32::MAX as usize {
            return Err(ScopeError::InvalidParameter(format!("depth {} too large", settings.depth)));
        }
        Ok(settings)
    }

    fn generate_on_device(
        &self,
        settings: &ToneSettings,
        out: &mut UniformWaveform<f32>,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<bool> {
        let half_amplitude = (settings.amplitude / 2.0) as f32;
        let count = settings.depth as u32;
        if let Some(pipe) = ctx.compute().pipeline(TONE) {
            let push = TonePush {
                radians_per_sample: settings.radians_per_sample(),
                start_phase: settings.start_phase,
                half_amplitude,
                bias: settings.bias as f32,
                count,
            };
            return Self::dispatch(pipe, &push, settings.depth, out, ctx);
        }
        if let Some(pipe) = ctx.compute().pipeline(TONE_F32) {
            let push = ToneTurnsPush::new(
                settings.frequency / settings.sample_rate,
                settings.start_phase,
                half_amplitude,
                settings.bias as f32,
                count,
            );
            return Self::dispatch(pipe, &push, settings.depth, out, ctx);
        }
        Ok(false)
    }

    fn dispatch<P: PushConstants>(
        mut pipe: ComputePipeline,
        push: &P,
        depth: usize,
        out: &mut UniformWaveform<f32>,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<bool> {
        if !pipe.fits(depth) {
            return Ok(false);
        }
        out.resize(depth)?;
        pipe.bind_buffer(0, &mut out.samples, ctx.cmd(), true)?;
        let groups = pipe.groups_for(depth);
        pipe.dispatch(ctx.cmd(), push, groups, 1, 1)?;
        ctx.submit_and_block()?;
        out.mark_modified_from_gpu();
        Ok(true)
    }
}

impl Filter for ToneFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, _i: usize, _stream: &Stream) -> bool {
        false
    }

    fn input_location(&self) -> InputLocation {
        InputLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let settings = self.settings()?;
        let mut out = UniformWaveform::new(timescale_for_rate(settings.sample_rate));
        out.header.stamp_now();

        if !self.generate_on_device(&settings, &mut out, ctx)? {
            out.samples = AcceleratedBuffer::from_vec(settings.generate());
            out.mark_modified_from_cpu();
        }

        tracing::debug!(
            "{} generated {} samples at {} Hz",
            self.core.id(),
            settings.depth,
            settings.frequency
        );
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}
