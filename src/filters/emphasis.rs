//! Two-tap FIR emphasis / de-emphasis.
//!
//! With `e = 10^(-dB/20)` the taps are `c = (e + 1) / 2` on the current bit
//! and `p = (e - 1) / 2` on the previous one, one UI apart. Pre-emphasis
//! scales the result by `1 / e`. The first UI of the input has no previous
//! bit, so the output starts one tap later.

use crate::buffer::{AcceleratedBuffer, PoolId, ScratchPool};
use crate::compute::kernels::{EmphasisPush, EMPHASIS};
use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, Filter, FilterParameter, InputLocation, NodeCore, RefreshContext, Stream};
use crate::units::Unit;
use crate::waveform::{UniformWaveform, Waveform, FS_PER_SECOND};

pub const NAME: &str = "Emphasis";

pub const PARAM_TYPE: &str = "Emphasis Type";
pub const PARAM_AMOUNT: &str = "Emphasis Amount";
pub const PARAM_DATA_RATE: &str = "Data Rate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmphasisType {
    DeEmphasis = 0,
    PreEmphasis = 1,
}

impl EmphasisType {
    fn from_index(i: i64) -> Self {
        if i == EmphasisType::PreEmphasis as i64 {
            EmphasisType::PreEmphasis
        } else {
            EmphasisType::DeEmphasis
        }
    }
}

/// Filter taps for an emphasis amount in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmphasisTaps {
    pub c: f32,
    pub p: f32,
    pub scale: f32,
}

impl EmphasisTaps {
    pub fn new(kind: EmphasisType, db: f64) -> Self {
        let e = 10f64.powf(-db / 20.0);
        let scale = match kind {
            EmphasisType::DeEmphasis => 1.0,
            EmphasisType::PreEmphasis => 1.0 / e,
        };
        Self {
            c: ((e + 1.0) / 2.0) as f32,
            p: ((e - 1.0) / 2.0) as f32,
            scale: scale as f32,
        }
    }
}

/// Reference implementation of the `emphasis` kernel
pub fn apply_emphasis(samples: &[f32], tap: usize, taps: EmphasisTaps) -> Vec<f32> {
    let count = samples.len().saturating_sub(tap);
    (0..count)
        .map(|i| (samples[i + tap] * taps.c + samples[i] * taps.p) * taps.scale)
        .collect()
}

#[derive(Debug)]
pub struct EmphasisFilter {
    core: NodeCore,
}

impl EmphasisFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::analog("data", Unit::Volts));
        let params = core.parameters_mut();
        params.insert(
            PARAM_TYPE,
            FilterParameter::enumeration(
                &[
                    ("De-emphasis", EmphasisType::DeEmphasis as i64),
                    ("Pre-emphasis", EmphasisType::PreEmphasis as i64),
                ],
                EmphasisType::DeEmphasis as i64,
            ),
        );
        params.insert(PARAM_AMOUNT, FilterParameter::float(6.0, Unit::Db));
        params.insert(PARAM_DATA_RATE, FilterParameter::float(1.25e9, Unit::BitsPerSecond));
        Self { core }
    }

    pub fn taps(&self) -> EmphasisTaps {
        let p = self.core.parameters();
        EmphasisTaps::new(EmphasisType::from_index(p.int(PARAM_TYPE)), p.float(PARAM_AMOUNT))
    }

    /// Samples per UI at the given input timescale
    pub fn samples_per_tap(&self, timescale: i64) -> Result<usize> {
        let rate = self.core.parameters().float(PARAM_DATA_RATE);
        if rate.is_nan() || rate <= 0.0 {
            return Err(ScopeError::InvalidParameter(format!("data rate must be positive, got {}", rate)));
        }
        let ui_fs = FS_PER_SECOND as f64 / rate;
        let tap = (ui_fs / timescale.max(1) as f64).round();
        if tap < 1.0 {
            return Err(ScopeError::InvalidInput(format!(
                "sample interval {} fs is longer than one UI",
                timescale
            )));
        }
        Ok(tap as usize)
    }

    fn run_on_device(
        input: &UniformWaveform<f32>,
        out: &mut UniformWaveform<f32>,
        tap: usize,
        taps: EmphasisTaps,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<bool> {
        let Some(mut pipe) = ctx.compute().pipeline(EMPHASIS) else {
            return Ok(false);
        };
        let count = input.len() - tap;
        if !pipe.fits(count) {
            return Ok(false);
        }
        out.resize(count)?;
        pipe.bind_input(0, &input.samples, ctx.cmd())?;
        pipe.bind_buffer(1, &mut out.samples, ctx.cmd(), true)?;
        let push = EmphasisPush {
            count: count as u32,
            samples_per_tap: tap as u32,
            c: taps.c,
            p: taps.p,
            scale: taps.scale,
        };
        let groups = pipe.groups_for(count);
        pipe.dispatch(ctx.cmd(), &push, groups, 1, 1)?;
        ctx.submit_and_block()?;
        out.mark_modified_from_gpu();
        Ok(true)
    }
}

impl Filter for EmphasisFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_analog_waveform(stream)
    }

    fn input_location(&self) -> InputLocation {
        InputLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let input = match ctx.input_waveform(0)? {
            Waveform::UniformAnalog(w) => w,
            _ => {
                return Err(ScopeError::InvalidInput(
                    "emphasis needs a uniformly sampled analog input".to_string(),
                ))
            }
        };
        let ts = input.header.timescale;
        let tap = self.samples_per_tap(ts)?;
        if tap >= input.len() {
            return Err(ScopeError::InvalidInput(format!(
                "waveform of {} samples is shorter than one UI ({} samples)",
                input.len(),
                tap
            )));
        }
        if tap > u32::MAX as usize || input.len() > u32::MAX as usize {
            return Err(ScopeError::InvalidInput("waveform too long".to_string()));
        }
        let taps = self.taps();

        let mut out = UniformWaveform::new(ts);
        out.header.copy_timebase_from(&input.header);
        out.header.trigger_phase = input.header.trigger_phase + tap as i64 * ts;

        if !Self::run_on_device(input, &mut out, tap, taps, ctx)? {
            let result = if input.samples.host_valid() {
                apply_emphasis(input.samples.as_slice(), tap, taps)
            } else {
                let pool = ScratchPool::global();
                let mut staged = pool.allocate::<f32>(PoolId::SCRATCH);
                staged.copy_from(&input.samples)?;
                staged.prepare_for_cpu_access()?;
                let result = apply_emphasis(staged.as_slice(), tap, taps);
                pool.free(staged, PoolId::SCRATCH);
                result
            };
            out.samples = AcceleratedBuffer::from_vec(result);
            out.mark_modified_from_cpu();
        }

        if let Some(y_unit) = ctx.input(0).map(|s| s.y_unit) {
            self.core.streams_mut()[0].y_unit = y_unit;
        }
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeContext, ComputeDevice, DeviceCaps};
    use crate::filters::test_support;

    fn output(f: &mut EmphasisFilter) -> (i64, Vec<f32>) {
        let w = f.core_mut().stream_mut(0).unwrap().waveform_mut().unwrap();
        w.prepare_for_cpu_access().unwrap();
        let phase = w.header().trigger_phase;
        (phase, w.as_uniform_analog().unwrap().samples.to_vec())
    }

    fn step(n: usize, at: usize) -> Vec<f32> {
        (0..n).map(|i| if i >= at { 1.0 } else { 0.0 }).collect()
    }

    #[test]
    fn test_step_response() {
        // 10 GSa/s, 1.25 Gb/s: 8 samples per UI
        let mut f = EmphasisFilter::new("#ffffff");
        let input = test_support::analog_stream(step(400, 100), 100_000);
        test_support::refresh(&mut f, &[&input]).unwrap();

        let tap = 8;
        let (phase, out) = output(&mut f);
        assert_eq!(phase, tap as i64 * 100_000);
        let at = |sample: usize| out[sample - tap];

        let e = 10f64.powf(-0.3);
        assert!((at(100) as f64 - (e + 1.0) / 2.0).abs() < 1e-6);
        assert!((at(100) - 0.7506).abs() < 1e-4);
        assert!((at(100 + tap) as f64 - e).abs() < 1e-6);
        assert_eq!(at(99), 0.0);
    }

    #[test]
    fn test_impulse_response_is_exact() {
        let taps = EmphasisTaps::new(EmphasisType::DeEmphasis, 3.5);
        let tap = 5;
        let mut impulse = vec![0.0f32; 64];
        impulse[20] = 1.0;
        let out = apply_emphasis(&impulse, tap, taps);
        // Output index i is input time i + tap
        for (i, &v) in out.iter().enumerate() {
            let n = i + tap;
            let expected = if n == 20 {
                taps.c
            } else if n == 20 + tap {
                taps.p
            } else {
                0.0
            };
            assert_eq!(v, expected, "time {}", n);
        }
    }

    #[test]
    fn test_pre_emphasis_scale() {
        let taps = EmphasisTaps::new(EmphasisType::PreEmphasis, 6.0);
        let e = 10f64.powf(-0.3);
        assert!((taps.scale as f64 - 1.0 / e).abs() < 1e-6);
        // Settled level of a long run stays at 1.0
        assert!(((taps.c + taps.p) * taps.scale - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_device_matches_reference() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let compute = ComputeContext::with_device(dev.clone());
        let samples: Vec<f32> = (0..1000).map(|i| ((i * 37) % 11) as f32 / 11.0 - 0.5).collect();
        let input = test_support::analog_stream(samples.clone(), 100_000);

        let mut f = EmphasisFilter::new("#ffffff");
        test_support::refresh_on(&mut f, &[&input], &compute).unwrap();
        assert_eq!(dev.stats().dispatches, 1);
        let (_, gpu) = output(&mut f);
        let cpu = apply_emphasis(&samples, 8, f.taps());
        assert_eq!(gpu, cpu);
    }

    #[test]
    fn test_short_input() {
        let mut f = EmphasisFilter::new("#ffffff");
        let input = test_support::analog_stream(vec![0.0; 4], 100_000);
        assert!(matches!(
            test_support::refresh(&mut f, &[&input]),
            Err(ScopeError::InvalidInput(_))
        ));
    }
}
