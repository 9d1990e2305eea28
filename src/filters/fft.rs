//! FFT magnitude spectrum.
//!
//! Input is a uniformly sampled analog waveform; output is the single-sided
//! magnitude in dB over frequency, one sample per bin. The frequency axis is
//! stored in millihertz so low-rate captures keep their sub-hertz bin width.
//!
//! Power-of-two lengths run on the compute device when one is available: a
//! radix-2 Stockham pass per octave followed by the dB conversion, all in
//! single precision. Other lengths use rustfft in double precision.
//!
//! Window functions:
//! - Rectangular (no windowing)
//! - Hann (default, good general purpose)
//! - Hamming (reduced near side lobes)
//! - Blackman (very low side lobes)
//! - Flat-top (accurate amplitude)

use crate::buffer::pool::{PoolId, ScratchPool};
use crate::buffer::AcceleratedBuffer;
use crate::compute::kernels::{FftStagePush, SpectrumPush, FFT_STAGE, SPECTRUM_DB};
use crate::compute::ComputePipeline;
use crate::error::{Result, ScopeError};
use crate::graph::{is_analog_waveform, Filter, FilterParameter, NodeCore, RefreshContext, Stream, StreamType};
use crate::units::Unit;
use crate::waveform::{UniformWaveform, Waveform, FS_PER_SECOND};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;
use std::fmt;

pub const NAME: &str = "FFT";

pub const PARAM_WINDOW: &str = "Window";
pub const PARAM_REMOVE_DC: &str = "Remove DC";

/// Magnitudes below this are reported at the floor
const DB_FLOOR: f64 = -200.0;

/// Window function applied before the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowFunction {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
    FlatTop,
}

impl WindowFunction {
    pub fn display_name(&self) -> &'static str {
        match self {
            WindowFunction::Rectangular => "Rectangular",
            WindowFunction::Hann => "Hann",
            WindowFunction::Hamming => "Hamming",
            WindowFunction::Blackman => "Blackman",
            WindowFunction::FlatTop => "Flat Top",
        }
    }

    pub fn all() -> &'static [WindowFunction] {
        &[
            WindowFunction::Rectangular,
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::Blackman,
            WindowFunction::FlatTop,
        ]
    }

    /// Value stored in the enum parameter
    pub fn index(&self) -> i64 {
        Self::all().iter().position(|w| w == self).unwrap_or(0) as i64
    }

    pub fn from_index(i: i64) -> Self {
        usize::try_from(i)
            .ok()
            .and_then(|i| Self::all().get(i).copied())
            .unwrap_or_default()
    }

    /// Coefficient at position `i` of `n`
    pub fn coefficient(&self, i: usize, n: usize) -> f64 {
        let x = 2.0 * PI * i as f64 / n as f64;
        match self {
            WindowFunction::Rectangular => 1.0,
            WindowFunction::Hann => 0.5 * (1.0 - x.cos()),
            WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
            // Exactly 0 at the ends; rounding of 0.42/0.08 can go slightly negative
            WindowFunction::Blackman => (0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()).max(0.0),
            WindowFunction::FlatTop => {
                0.21557895 - 0.41663158 * x.cos() + 0.277263158 * (2.0 * x).cos()
                    - 0.083578947 * (3.0 * x).cos()
                    + 0.006947368 * (4.0 * x).cos()
            }
        }
    }

    pub fn generate(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.coefficient(i, n)).collect()
    }
}

/// Single-sided magnitude spectrum
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// Hz per bin
    pub bin_width: f64,
    /// Magnitude in dB per bin, DC first
    pub magnitude_db: Vec<f32>,
}

impl Spectrum {
    /// Index and level of the strongest bin above DC
    pub fn peak(&self) -> Option<(usize, f32)> {
        self.magnitude_db
            .iter()
            .copied()
            .enumerate()
            .skip(1)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
    }
}

/// Transform `samples` taken every `timescale` femtoseconds
pub fn compute_spectrum(
    planner: &mut FftPlanner<f64>,
    samples: &[f32],
    timescale: i64,
    window: WindowFunction,
    remove_dc: bool,
) -> Result<Spectrum> {
    spectrum_with_pool(ScratchPool::global(), planner, samples, timescale, window, remove_dc)
}

/// [`compute_spectrum`] with window scratch taken from `pool`
fn spectrum_with_pool(
    pool: &ScratchPool,
    planner: &mut FftPlanner<f64>,
    samples: &[f32],
    timescale: i64,
    window: WindowFunction,
    remove_dc: bool,
) -> Result<Spectrum> {
    let n = samples.len();
    check_input(n, timescale)?;

    let mean = if remove_dc {
        crate::util::kahan_mean(samples)
    } else {
        0.0
    };
    let coefficients = window_coefficients(pool, window, n)?;
    let gain: f64 = coefficients.iter().sum::<f64>().max(f64::MIN_POSITIVE);

    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .zip(coefficients.iter())
        .map(|(&s, &w)| Complex::new((s as f64 - mean) * w, 0.0))
        .collect();
    pool.free(coefficients, PoolId::FFT);
    planner.plan_fft_forward(n).process(&mut buffer);

    let bins = n / 2 + 1;
    let magnitude_db = buffer
        .iter()
        .take(bins)
        .enumerate()
        .map(|(k, c)| {
            // DC and Nyquist have no mirror image
            let scale = if k == 0 || (n % 2 == 0 && k == n / 2) { 1.0 } else { 2.0 };
            let mag = scale * c.norm() / gain;
            if mag > 1e-10 {
                (20.0 * mag.log10()) as f32
            } else {
                DB_FLOOR as f32
            }
        })
        .collect();

    Ok(Spectrum {
        bin_width: bin_width(n, timescale),
        magnitude_db,
    })
}

fn check_input(n: usize, timescale: i64) -> Result<()> {
    if n < 2 {
        return Err(ScopeError::InvalidInput(format!("FFT needs at least 2 samples, got {}", n)));
    }
    if timescale <= 0 {
        return Err(ScopeError::InvalidInput(format!("bad timescale {}", timescale)));
    }
    Ok(())
}

fn bin_width(n: usize, timescale: i64) -> f64 {
    let sample_rate = FS_PER_SECOND as f64 / timescale as f64;
    sample_rate / n as f64
}

/// Window coefficients in a buffer from the FFT pool; the caller frees it
fn window_coefficients(pool: &ScratchPool, window: WindowFunction, n: usize) -> Result<AcceleratedBuffer<f64>> {
    let mut coefficients = pool.allocate::<f64>(PoolId::FFT);
    coefficients.resize(n)?;
    coefficients.mark_modified_from_cpu();
    for (i, c) in coefficients.as_mut_slice().iter_mut().enumerate() {
        *c = window.coefficient(i, n);
    }
    Ok(coefficients)
}

/// Bin width as a whole number of millihertz
pub fn bin_width_millihertz(bin_width: f64) -> Result<i64> {
    let mhz = (bin_width * 1000.0).round();
    if !(1.0..=i64::MAX as f64).contains(&mhz) {
        return Err(ScopeError::InvalidInput(format!(
            "bin width of {} Hz cannot be represented",
            bin_width
        )));
    }
    Ok(mhz as i64)
}

pub struct FftFilter {
    core: NodeCore,
    planner: FftPlanner<f64>,
}

impl fmt::Debug for FftFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftFilter").field("core", &self.core).finish_non_exhaustive()
    }
}

impl FftFilter {
    pub fn new(color: &str) -> Self {
        let mut core = NodeCore::new(NAME, color);
        core.create_input("din");
        core.add_stream(Stream::new("magnitude", StreamType::Analog, Unit::Millihertz, Unit::Db));

        let names: Vec<(&str, i64)> = WindowFunction::all()
            .iter()
            .map(|w| (w.display_name(), w.index()))
            .collect();
        let params = core.parameters_mut();
        params.insert(
            PARAM_WINDOW,
            FilterParameter::enumeration(&names, WindowFunction::default().index()),
        );
        params.insert(PARAM_REMOVE_DC, FilterParameter::boolean(true));

        Self {
            core,
            planner: FftPlanner::new(),
        }
    }

    pub fn window(&self) -> WindowFunction {
        WindowFunction::from_index(self.core.parameters().int(PARAM_WINDOW))
    }

    /// Levels computed on the compute device, or `None` to use the CPU path
    fn spectrum_on_device(
        input: &UniformWaveform<f32>,
        window: WindowFunction,
        remove_dc: bool,
        ctx: &mut RefreshContext<'_>,
    ) -> Result<Option<(f64, AcceleratedBuffer<f32>)>> {
        let n = input.len();
        if n < 2 || !n.is_power_of_two() || n > u32::MAX as usize {
            return Ok(None);
        }
        let (Some(mut stage), Some(mut level)) =
            (ctx.compute().pipeline(FFT_STAGE), ctx.compute().pipeline(SPECTRUM_DB))
        else {
            return Ok(None);
        };
        let bins = n / 2 + 1;
        if !stage.fits(n / 2) || !level.fits(bins) {
            return Ok(None);
        }
        let timescale = input.header.timescale;
        check_input(n, timescale)?;

        let samples = input.samples.as_slice();
        let pool = ScratchPool::global();
        let mean = if remove_dc {
            crate::util::kahan_mean(samples)
        } else {
            0.0
        };
        let coefficients = window_coefficients(pool, window, n)?;
        let gain: f64 = coefficients.iter().sum::<f64>().max(f64::MIN_POSITIVE);

        // Interleaved complex f32, ping-ponged between passes
        let mut staging = [
            pool.allocate::<f32>(PoolId::DEVICE_STAGING),
            pool.allocate::<f32>(PoolId::DEVICE_STAGING),
        ];
        for buffer in staging.iter_mut() {
            buffer.resize(2 * n)?;
        }
        staging[0].mark_modified_from_cpu();
        for (pair, (&s, &w)) in staging[0]
            .as_mut_slice()
            .chunks_exact_mut(2)
            .zip(samples.iter().zip(coefficients.iter()))
        {
            pair[0] = ((s as f64 - mean) * w) as f32;
            pair[1] = 0.0;
        }
        pool.free(coefficients, PoolId::FFT);

        let passes = n.trailing_zeros();
        let stage_groups = stage.groups_for(n / 2);
        for pass in 0..passes {
            let (head, tail) = staging.split_at_mut(1);
            let (src, dst) = if pass % 2 == 0 {
                (&mut head[0], &mut tail[0])
            } else {
                (&mut tail[0], &mut head[0])
            };
            stage.bind_buffer(0, src, ctx.cmd(), false)?;
            stage.bind_buffer(1, dst, ctx.cmd(), true)?;
            let push = FftStagePush {
                n: n as u32,
                span: 1 << pass,
            };
            stage.dispatch(ctx.cmd(), &push, stage_groups, 1, 1)?;
            dst.mark_modified_from_gpu();
            ComputePipeline::add_compute_memory_barrier(ctx.cmd());
        }

        let mut levels = AcceleratedBuffer::<f32>::new();
        levels.resize(bins)?;
        level.bind_buffer(0, &mut staging[(passes % 2) as usize], ctx.cmd(), false)?;
        level.bind_buffer(1, &mut levels, ctx.cmd(), true)?;
        let push = SpectrumPush {
            bins: bins as u32,
            n: n as u32,
            inv_gain: (1.0 / gain) as f32,
            floor: DB_FLOOR as f32,
        };
        let level_groups = level.groups_for(bins);
        level.dispatch(ctx.cmd(), &push, level_groups, 1, 1)?;
        ctx.submit_and_block()?;
        levels.mark_modified_from_gpu();

        for buffer in staging {
            pool.free(buffer, PoolId::DEVICE_STAGING);
        }
        Ok(Some((bin_width(n, timescale), levels)))
    }
}

impl Filter for FftFilter {
    crate::graph::filter_core!();

    fn validate_channel(&self, i: usize, stream: &Stream) -> bool {
        i == 0 && is_analog_waveform(stream)
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> Result<()> {
        let input = match ctx.input_waveform(0)? {
            Waveform::UniformAnalog(w) => w,
            _ => {
                return Err(ScopeError::InvalidInput(
                    "FFT needs a uniformly sampled analog input".to_string(),
                ))
            }
        };
        let window = self.window();
        let remove_dc = self.core.parameters().bool(PARAM_REMOVE_DC);
        let (bin_width, levels) = match Self::spectrum_on_device(input, window, remove_dc, ctx)? {
            Some(found) => found,
            None => {
                let spectrum = compute_spectrum(
                    &mut self.planner,
                    input.samples.as_slice(),
                    input.header.timescale,
                    window,
                    remove_dc,
                )?;
                let mut levels = AcceleratedBuffer::from_vec(spectrum.magnitude_db);
                levels.mark_modified_from_cpu();
                (spectrum.bin_width, levels)
            }
        };

        let bins = levels.len();
        let mut out = UniformWaveform::new(bin_width_millihertz(bin_width)?);
        out.samples = levels;
        out.header.start_timestamp = input.header.start_timestamp;
        out.header.start_femtoseconds = input.header.start_femtoseconds;

        tracing::debug!(
            "{} {} window, {} bins of {:.3} Hz",
            self.core.id(),
            window.display_name(),
            bins,
            bin_width
        );
        self.core.set_output_waveform(0, out.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{ComputeContext, ComputeDevice, DeviceCaps};
    use crate::filters::test_support;
    use serial_test::serial;

    fn sine(fs: f64, f: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * f * i as f64 / fs).sin() as f32)
            .collect()
    }

    #[test]
    fn test_window_functions() {
        for window in WindowFunction::all() {
            let coeffs = window.generate(100);
            assert_eq!(coeffs.len(), 100);
            // Flat-top has small negative side lobes
            for &c in &coeffs {
                assert!((-0.1..=1.5).contains(&c), "{} coefficient {}", window.display_name(), c);
            }
            assert_eq!(WindowFunction::from_index(window.index()), *window);
        }
        assert_eq!(WindowFunction::from_index(99), WindowFunction::Hann);
    }

    #[test]
    fn test_sine_peak_bin() {
        let mut planner = FftPlanner::new();
        let spectrum = compute_spectrum(&mut planner, &sine(1000.0, 50.0, 1000), 1_000_000_000_000, WindowFunction::Hann, true).unwrap();
        let (bin, level) = spectrum.peak().unwrap();
        assert_eq!(bin, 50);
        assert!((spectrum.bin_width - 1.0).abs() < 1e-9);
        // Unit-amplitude sine reads 0 dB after window gain correction
        assert!(level.abs() < 0.1, "level {}", level);
    }

    #[test]
    fn test_dc_removal() {
        let mut planner = FftPlanner::new();
        let samples = vec![5.0f32; 256];
        let spectrum = compute_spectrum(&mut planner, &samples, 1000, WindowFunction::Rectangular, true).unwrap();
        assert!(spectrum.magnitude_db[0] <= DB_FLOOR as f32);
    }

    #[test]
    fn test_too_short() {
        let mut planner = FftPlanner::new();
        assert!(compute_spectrum(&mut planner, &[1.0], 1000, WindowFunction::Hann, false).is_err());
    }

    #[test]
    fn test_refresh_output_axis() {
        let mut f = FftFilter::new("#ffffff");
        let fs = 1e9;
        let input = test_support::analog_stream(sine(fs, 1e8, 1000), 1_000_000);
        test_support::refresh(&mut f, &[&input]).unwrap();

        let stream = f.core().stream(0).unwrap();
        assert_eq!(stream.x_unit, Unit::Millihertz);
        let w = stream.waveform().unwrap();
        assert_eq!(w.len(), 501);
        assert_eq!(w.header().timescale, 1_000_000_000);

        let view = w.analog().unwrap();
        let peak = (1..view.len()).max_by(|&a, &b| view.value(a).total_cmp(&view.value(b))).unwrap();
        assert!((view.offset_scaled(peak) as f64 * 1e-3 - 1e8).abs() <= 0.5e6);
    }

    #[test]
    fn test_sub_hertz_bins_keep_their_width() {
        // 1 kSa/s for 3 s: bins of 1/3 Hz, tone at 100 Hz in bin 300
        let mut f = FftFilter::new("#ffffff");
        let input = test_support::analog_stream(sine(1000.0, 100.0, 3000), 1_000_000_000_000);
        test_support::refresh(&mut f, &[&input]).unwrap();

        let w = f.core().stream(0).unwrap().waveform().unwrap();
        assert_eq!(w.len(), 1501);
        assert_eq!(w.header().timescale, 333);

        let view = w.analog().unwrap();
        let peak = (1..view.len()).max_by(|&a, &b| view.value(a).total_cmp(&view.value(b))).unwrap();
        assert_eq!(peak, 300);
        let hz = view.offset_scaled(peak) as f64 * 1e-3;
        assert!((hz - 100.0).abs() < 0.2, "peak at {} Hz", hz);
    }

    #[test]
    fn test_bin_width_range() {
        assert_eq!(bin_width_millihertz(0.25).unwrap(), 250);
        assert_eq!(bin_width_millihertz(1e6).unwrap(), 1_000_000_000);
        assert!(bin_width_millihertz(1e-4).is_err());
    }

    #[test]
    fn test_window_scratch_returns_to_pool() {
        let pool = ScratchPool::new();
        let mut planner = FftPlanner::new();
        let samples = sine(1000.0, 50.0, 512);
        let first = spectrum_with_pool(&pool, &mut planner, &samples, 1_000_000_000_000, WindowFunction::Hann, true).unwrap();
        assert_eq!(pool.stats().cached, 1);
        let second = spectrum_with_pool(&pool, &mut planner, &samples, 1_000_000_000_000, WindowFunction::Hann, true).unwrap();
        assert_eq!(pool.stats().cached, 1);
        assert_eq!(first, second);

        // A shorter transform reuses the cached buffer without stale coefficients
        let short = spectrum_with_pool(&pool, &mut planner, &samples[..256], 1_000_000_000_000, WindowFunction::Hann, true).unwrap();
        let fresh = spectrum_with_pool(&ScratchPool::new(), &mut planner, &samples[..256], 1_000_000_000_000, WindowFunction::Hann, true).unwrap();
        assert_eq!(short, fresh);
    }

    fn device_levels(f: &mut FftFilter) -> (i64, Vec<f32>) {
        let w = f.core_mut().stream_mut(0).unwrap().waveform_mut().unwrap();
        w.prepare_for_cpu_access().unwrap();
        let w = w.as_uniform_analog().unwrap();
        (w.header.timescale, w.samples.to_vec())
    }

    #[test]
    #[serial]
    fn test_device_spectrum_matches_cpu() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let compute = ComputeContext::with_device(dev.clone());
        // Tone centred on bin 100 plus a weaker one between bins
        let n = 1024;
        let fs = 1e9;
        let samples: Vec<f32> = sine(fs, fs * 100.0 / n as f64, n)
            .iter()
            .zip(sine(fs, fs * 250.5 / n as f64, n))
            .map(|(a, b)| a + 0.01 * b)
            .collect();

        let mut f = FftFilter::new("#ffffff");
        let input = test_support::analog_stream(samples.clone(), 1_000_000);
        test_support::refresh_on(&mut f, &[&input], &compute).unwrap();
        // Ten passes for 1024 points, then the dB conversion
        assert_eq!(dev.stats().dispatches, 11);

        let (timescale, got) = device_levels(&mut f);
        let cpu = compute_spectrum(&mut FftPlanner::new(), &samples, 1_000_000, WindowFunction::Hann, true).unwrap();
        assert_eq!(timescale, bin_width_millihertz(cpu.bin_width).unwrap());
        assert_eq!(got.len(), cpu.magnitude_db.len());
        for (k, (&g, &c)) in got.iter().zip(&cpu.magnitude_db).enumerate() {
            if c > -80.0 {
                assert!((g - c).abs() < 0.01, "bin {}: device {} dB, cpu {} dB", k, g, c);
            } else {
                assert!(g < -70.0, "bin {}: device {} dB, cpu {} dB", k, g, c);
            }
        }
        assert_eq!(Spectrum { bin_width: cpu.bin_width, magnitude_db: got }.peak().unwrap().0, 100);
    }

    #[test]
    #[serial]
    fn test_device_spectrum_reuses_staging() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let compute = ComputeContext::with_device(dev.clone());
        let mut f = FftFilter::new("#ffffff");
        let input = test_support::analog_stream(sine(1000.0, 50.0, 256), 1_000_000_000_000);

        // Two staging buffers plus the output levels
        test_support::refresh_on(&mut f, &[&input], &compute).unwrap();
        assert_eq!(dev.stats().allocations, 3);
        let used = dev.memory_used();

        // Staging comes back from the pool with its device storage
        test_support::refresh_on(&mut f, &[&input], &compute).unwrap();
        assert_eq!(dev.stats().allocations, 4);
        assert_eq!(dev.stats().dispatches, 18);
        assert_eq!(dev.memory_used(), used);
    }

    #[test]
    #[serial]
    fn test_odd_length_stays_on_cpu() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let compute = ComputeContext::with_device(dev.clone());
        let samples = sine(1e9, 1e8, 1000);
        let mut f = FftFilter::new("#ffffff");
        let input = test_support::analog_stream(samples.clone(), 1_000_000);
        test_support::refresh_on(&mut f, &[&input], &compute).unwrap();
        assert_eq!(dev.stats().dispatches, 0);

        let (_, got) = device_levels(&mut f);
        let cpu = compute_spectrum(&mut FftPlanner::new(), &samples, 1_000_000, WindowFunction::Hann, true).unwrap();
        assert_eq!(got, cpu.magnitude_db);
    }

    #[test]
    fn test_sparse_input_rejected() {
        let mut f = FftFilter::new("#ffffff");
        let mut sparse = crate::waveform::SparseWaveform::new(1);
        sparse.push(0, 1, 1.0f32);
        sparse.push(1, 1, 2.0f32);
        let mut input = Stream::analog("in", Unit::Volts);
        input.set_waveform(Some(sparse.into()));
        assert!(matches!(
            test_support::refresh(&mut f, &[&input]),
            Err(ScopeError::InvalidInput(_))
        ));
    }
}
