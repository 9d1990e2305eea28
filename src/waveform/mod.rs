//! Waveform data model.
//!
//! A waveform is an ordered sample sequence plus a [`WaveformHeader`]. The
//! layout is either uniform (offsets implicit) or sparse (explicit offsets
//! and durations in units of `timescale`). Concrete combinations are
//! gathered in the tagged [`Waveform`] enum; [`AnalogView`] and
//! [`DigitalView`] let code read either layout through one interface.

pub mod edges;
pub mod protocol;
pub mod sparams;

pub use protocol::{AnyProtocolWaveform, ProtocolSymbol, ProtocolWaveform, StandardColor};

use crate::buffer::AcceleratedBuffer;
use crate::compute::{ComputeDevice, DeviceElement};
use crate::error::{Result, ScopeError};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Femtoseconds in one second
pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// Timescale (femtoseconds per sample) for a sample rate in Hz
pub fn timescale_for_rate(sample_rate_hz: f64) -> i64 {
    if sample_rate_hz <= 0.0 {
        return 1;
    }
    ((FS_PER_SECOND as f64) / sample_rate_hz).round().max(1.0) as i64
}

/// Waveform annotation bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct WaveformFlags(pub u8);

impl WaveformFlags {
    /// Some samples hit the ADC limits
    pub const CLIPPING: WaveformFlags = WaveformFlags(0x01);

    pub fn contains(self, other: WaveformFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: WaveformFlags) {
        self.0 |= other.0;
    }
}

/// Metadata shared by every waveform layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformHeader {
    /// Femtoseconds (or X-axis units) per offset unit
    pub timescale: i64,
    /// Wall-clock start, whole seconds since the Unix epoch
    pub start_timestamp: i64,
    /// Sub-second part of the start, in femtoseconds
    pub start_femtoseconds: i64,
    /// Offset of sample zero from the trigger, always femtoseconds
    pub trigger_phase: i64,
    pub revision: u64,
    pub flags: WaveformFlags,
}

impl Default for WaveformHeader {
    fn default() -> Self {
        Self {
            timescale: 1,
            start_timestamp: 0,
            start_femtoseconds: 0,
            trigger_phase: 0,
            revision: 0,
            flags: WaveformFlags::default(),
        }
    }
}

impl WaveformHeader {
    pub fn with_timescale(timescale: i64) -> Self {
        Self {
            timescale,
            ..Self::default()
        }
    }

    /// Copy timescale, start time and trigger phase from another header
    pub fn copy_timebase_from(&mut self, other: &WaveformHeader) {
        self.timescale = other.timescale;
        self.start_timestamp = other.start_timestamp;
        self.start_femtoseconds = other.start_femtoseconds;
        self.trigger_phase = other.trigger_phase;
    }

    /// Stamp the start time with the current wall clock
    pub fn stamp_now(&mut self) {
        let now = Utc::now();
        self.start_timestamp = now.timestamp();
        self.start_femtoseconds = now.timestamp_subsec_nanos() as i64 * 1_000_000;
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        let nanos = (self.start_femtoseconds / 1_000_000).clamp(0, 999_999_999) as u32;
        Utc.timestamp_opt(self.start_timestamp, nanos).single()
    }
}

/// Samples at implicit, equal spacing
#[derive(Debug)]
pub struct UniformWaveform<T: DeviceElement> {
    pub header: WaveformHeader,
    pub samples: AcceleratedBuffer<T>,
}

impl<T: DeviceElement> Default for UniformWaveform<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T: DeviceElement> UniformWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            samples: AcceleratedBuffer::new(),
        }
    }

    pub fn from_samples(samples: Vec<T>, timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            samples: AcceleratedBuffer::from_vec(samples),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[inline]
    pub fn offset(&self, i: usize) -> i64 {
        i as i64
    }

    #[inline]
    pub fn duration(&self, _i: usize) -> i64 {
        1
    }

    #[inline]
    pub fn offset_scaled(&self, i: usize) -> i64 {
        i as i64 * self.header.timescale + self.header.trigger_phase
    }

    #[inline]
    pub fn duration_scaled(&self, _i: usize) -> i64 {
        self.header.timescale
    }

    pub fn resize(&mut self, n: usize) -> Result<()> {
        self.samples.resize(n)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn prepare_for_cpu_access(&mut self) -> Result<()> {
        self.samples.prepare_for_cpu_access()
    }

    pub fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()> {
        self.samples.prepare_for_gpu_access(device)
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.samples.mark_modified_from_cpu();
    }

    pub fn mark_modified_from_gpu(&mut self) {
        self.samples.mark_modified_from_gpu();
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            header: self.header.clone(),
            samples: self.samples.try_clone()?,
        })
    }
}

/// Samples with explicit offsets and durations
#[derive(Debug)]
pub struct SparseWaveform<T: DeviceElement> {
    pub header: WaveformHeader,
    pub samples: AcceleratedBuffer<T>,
    pub offsets: AcceleratedBuffer<i64>,
    pub durations: AcceleratedBuffer<i64>,
}

impl<T: DeviceElement> Default for SparseWaveform<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T: DeviceElement> SparseWaveform<T> {
    pub fn new(timescale: i64) -> Self {
        Self {
            header: WaveformHeader::with_timescale(timescale),
            samples: AcceleratedBuffer::new(),
            offsets: AcceleratedBuffer::new(),
            durations: AcceleratedBuffer::new(),
        }
    }

    /// Sparse copy of a uniform waveform: offset `i`, duration 1
    pub fn from_uniform(src: &UniformWaveform<T>) -> Result<Self> {
        let mut out = Self::new(src.header.timescale);
        out.header = src.header.clone();
        out.samples.copy_from(&src.samples)?;
        out.samples.prepare_for_cpu_access()?;
        let n = src.len();
        out.offsets = AcceleratedBuffer::from_vec((0..n as i64).collect());
        out.durations = AcceleratedBuffer::from_vec(vec![1; n]);
        Ok(out)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append one sample. Requires host-current buffers.
    pub fn push(&mut self, offset: i64, duration: i64, value: T) {
        self.offsets.push(offset);
        self.durations.push(duration);
        self.samples.push(value);
    }

    #[inline]
    pub fn offset(&self, i: usize) -> i64 {
        self.offsets[i]
    }

    #[inline]
    pub fn duration(&self, i: usize) -> i64 {
        self.durations[i]
    }

    #[inline]
    pub fn offset_scaled(&self, i: usize) -> i64 {
        self.offsets[i] * self.header.timescale + self.header.trigger_phase
    }

    #[inline]
    pub fn duration_scaled(&self, i: usize) -> i64 {
        self.durations[i] * self.header.timescale
    }

    pub fn resize(&mut self, n: usize) -> Result<()> {
        self.samples.resize(n)?;
        self.offsets.resize(n)?;
        self.durations.resize(n)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.offsets.clear();
        self.durations.clear();
    }

    /// Check non-decreasing offsets and positive durations
    pub fn validate(&self) -> Result<()> {
        for i in 0..self.len() {
            if self.durations[i] <= 0 {
                return Err(ScopeError::InvalidInput(format!(
                    "sample {} has non-positive duration {}",
                    i, self.durations[i]
                )));
            }
            if i > 0 && self.offsets[i] < self.offsets[i - 1] {
                return Err(ScopeError::InvalidInput(format!(
                    "offset of sample {} decreases",
                    i
                )));
            }
        }
        Ok(())
    }

    pub fn prepare_for_cpu_access(&mut self) -> Result<()> {
        self.samples.prepare_for_cpu_access()?;
        self.offsets.prepare_for_cpu_access()?;
        self.durations.prepare_for_cpu_access()
    }

    pub fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()> {
        self.samples.prepare_for_gpu_access(device)?;
        self.offsets.prepare_for_gpu_access(device)?;
        self.durations.prepare_for_gpu_access(device)
    }

    pub fn mark_modified_from_cpu(&mut self) {
        self.samples.mark_modified_from_cpu();
        self.offsets.mark_modified_from_cpu();
        self.durations.mark_modified_from_cpu();
    }

    pub fn mark_modified_from_gpu(&mut self) {
        self.samples.mark_modified_from_gpu();
        self.offsets.mark_modified_from_gpu();
        self.durations.mark_modified_from_gpu();
    }

    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            header: self.header.clone(),
            samples: self.samples.try_clone()?,
            offsets: self.offsets.try_clone()?,
            durations: self.durations.try_clone()?,
        })
    }
}

/// Which concrete layout and sample type a waveform has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformKind {
    UniformAnalog,
    SparseAnalog,
    UniformDigital,
    SparseDigital,
    Protocol,
}

/// Any waveform a stream can carry
#[derive(Debug)]
pub enum Waveform {
    UniformAnalog(UniformWaveform<f32>),
    SparseAnalog(SparseWaveform<f32>),
    UniformDigital(UniformWaveform<bool>),
    SparseDigital(SparseWaveform<bool>),
    Protocol(Box<dyn AnyProtocolWaveform>),
}

macro_rules! dispatch {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            Waveform::UniformAnalog($w) => $body,
            Waveform::SparseAnalog($w) => $body,
            Waveform::UniformDigital($w) => $body,
            Waveform::SparseDigital($w) => $body,
            Waveform::Protocol($w) => $body,
        }
    };
}

impl Waveform {
    pub fn kind(&self) -> WaveformKind {
        match self {
            Waveform::UniformAnalog(_) => WaveformKind::UniformAnalog,
            Waveform::SparseAnalog(_) => WaveformKind::SparseAnalog,
            Waveform::UniformDigital(_) => WaveformKind::UniformDigital,
            Waveform::SparseDigital(_) => WaveformKind::SparseDigital,
            Waveform::Protocol(_) => WaveformKind::Protocol,
        }
    }

    pub fn header(&self) -> &WaveformHeader {
        match self {
            Waveform::Protocol(p) => p.header(),
            Waveform::UniformAnalog(w) => &w.header,
            Waveform::SparseAnalog(w) => &w.header,
            Waveform::UniformDigital(w) => &w.header,
            Waveform::SparseDigital(w) => &w.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut WaveformHeader {
        match self {
            Waveform::Protocol(p) => p.header_mut(),
            Waveform::UniformAnalog(w) => &mut w.header,
            Waveform::SparseAnalog(w) => &mut w.header,
            Waveform::UniformDigital(w) => &mut w.header,
            Waveform::SparseDigital(w) => &mut w.header,
        }
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self, Waveform::UniformAnalog(_) | Waveform::UniformDigital(_))
    }

    pub fn len(&self) -> usize {
        dispatch!(self, w => w.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn revision(&self) -> u64 {
        self.header().revision
    }

    pub fn offset(&self, i: usize) -> i64 {
        dispatch!(self, w => w.offset(i))
    }

    pub fn duration(&self, i: usize) -> i64 {
        dispatch!(self, w => w.duration(i))
    }

    /// `offset(i) * timescale + trigger_phase`
    pub fn offset_scaled(&self, i: usize) -> i64 {
        let h = self.header();
        self.offset(i) * h.timescale + h.trigger_phase
    }

    pub fn duration_scaled(&self, i: usize) -> i64 {
        self.duration(i) * self.header().timescale
    }

    pub fn analog(&self) -> Option<AnalogView<'_>> {
        match self {
            Waveform::UniformAnalog(w) => Some(AnalogView::Uniform(w)),
            Waveform::SparseAnalog(w) => Some(AnalogView::Sparse(w)),
            _ => None,
        }
    }

    pub fn digital(&self) -> Option<DigitalView<'_>> {
        match self {
            Waveform::UniformDigital(w) => Some(DigitalView::Uniform(w)),
            Waveform::SparseDigital(w) => Some(DigitalView::Sparse(w)),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Option<&dyn AnyProtocolWaveform> {
        match self {
            Waveform::Protocol(p) => Some(p.as_ref()),
            _ => None,
        }
    }

    pub fn as_uniform_analog(&self) -> Option<&UniformWaveform<f32>> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_analog_mut(&mut self) -> Option<&mut UniformWaveform<f32>> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_analog(&self) -> Option<&SparseWaveform<f32>> {
        match self {
            Waveform::SparseAnalog(w) => Some(w),
            _ => None,
        }
    }

    /// Make every buffer of the waveform host-current
    pub fn prepare_for_cpu_access(&mut self) -> Result<()> {
        match self {
            Waveform::UniformAnalog(w) => w.prepare_for_cpu_access(),
            Waveform::SparseAnalog(w) => w.prepare_for_cpu_access(),
            Waveform::UniformDigital(w) => w.prepare_for_cpu_access(),
            Waveform::SparseDigital(w) => w.prepare_for_cpu_access(),
            Waveform::Protocol(p) => p.prepare_for_cpu_access(),
        }
    }

    /// Make every buffer of the waveform device-current.
    ///
    /// Protocol payloads stay host-only; their timing buffers are uploaded.
    pub fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()> {
        match self {
            Waveform::UniformAnalog(w) => w.prepare_for_gpu_access(device),
            Waveform::SparseAnalog(w) => w.prepare_for_gpu_access(device),
            Waveform::UniformDigital(w) => w.prepare_for_gpu_access(device),
            Waveform::SparseDigital(w) => w.prepare_for_gpu_access(device),
            Waveform::Protocol(p) => p.prepare_for_gpu_access(device),
        }
    }

    pub fn try_clone(&self) -> Result<Waveform> {
        Ok(match self {
            Waveform::UniformAnalog(w) => Waveform::UniformAnalog(w.try_clone()?),
            Waveform::SparseAnalog(w) => Waveform::SparseAnalog(w.try_clone()?),
            Waveform::UniformDigital(w) => Waveform::UniformDigital(w.try_clone()?),
            Waveform::SparseDigital(w) => Waveform::SparseDigital(w.try_clone()?),
            Waveform::Protocol(p) => Waveform::Protocol(p.clone_box()?),
        })
    }
}

impl From<UniformWaveform<f32>> for Waveform {
    fn from(w: UniformWaveform<f32>) -> Self {
        Waveform::UniformAnalog(w)
    }
}

impl From<SparseWaveform<f32>> for Waveform {
    fn from(w: SparseWaveform<f32>) -> Self {
        Waveform::SparseAnalog(w)
    }
}

impl From<UniformWaveform<bool>> for Waveform {
    fn from(w: UniformWaveform<bool>) -> Self {
        Waveform::UniformDigital(w)
    }
}

impl From<SparseWaveform<bool>> for Waveform {
    fn from(w: SparseWaveform<bool>) -> Self {
        Waveform::SparseDigital(w)
    }
}

impl<S: ProtocolSymbol> From<ProtocolWaveform<S>> for Waveform {
    fn from(w: ProtocolWaveform<S>) -> Self {
        Waveform::Protocol(Box::new(w))
    }
}

macro_rules! sample_view {
    ($name:ident, $t:ty) => {
        /// Read access to either layout of one sample type
        #[derive(Debug, Clone, Copy)]
        pub enum $name<'a> {
            Uniform(&'a UniformWaveform<$t>),
            Sparse(&'a SparseWaveform<$t>),
        }

        impl<'a> $name<'a> {
            pub fn header(&self) -> &'a WaveformHeader {
                match self {
                    Self::Uniform(w) => &w.header,
                    Self::Sparse(w) => &w.header,
                }
            }

            pub fn samples(&self) -> &'a [$t] {
                match self {
                    Self::Uniform(w) => w.samples.as_slice(),
                    Self::Sparse(w) => w.samples.as_slice(),
                }
            }

            #[inline]
            pub fn value(&self, i: usize) -> $t {
                self.samples()[i]
            }

            pub fn len(&self) -> usize {
                match self {
                    Self::Uniform(w) => w.len(),
                    Self::Sparse(w) => w.len(),
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn is_uniform(&self) -> bool {
                matches!(self, Self::Uniform(_))
            }

            #[inline]
            pub fn offset(&self, i: usize) -> i64 {
                match self {
                    Self::Uniform(w) => w.offset(i),
                    Self::Sparse(w) => w.offset(i),
                }
            }

            #[inline]
            pub fn duration(&self, i: usize) -> i64 {
                match self {
                    Self::Uniform(w) => w.duration(i),
                    Self::Sparse(w) => w.duration(i),
                }
            }

            #[inline]
            pub fn offset_scaled(&self, i: usize) -> i64 {
                match self {
                    Self::Uniform(w) => w.offset_scaled(i),
                    Self::Sparse(w) => w.offset_scaled(i),
                }
            }

            #[inline]
            pub fn duration_scaled(&self, i: usize) -> i64 {
                match self {
                    Self::Uniform(w) => w.duration_scaled(i),
                    Self::Sparse(w) => w.duration_scaled(i),
                }
            }

            /// Index of the sample covering X position `x` (scaled units)
            pub fn index_at(&self, x: i64) -> Option<usize> {
                let n = self.len();
                if n == 0 || x < self.offset_scaled(0) {
                    return None;
                }
                let idx = match self {
                    Self::Uniform(w) => {
                        let ts = w.header.timescale.max(1);
                        ((x - w.header.trigger_phase) / ts) as usize
                    }
                    Self::Sparse(_) => {
                        let (mut lo, mut hi) = (0usize, n);
                        while hi - lo > 1 {
                            let mid = (lo + hi) / 2;
                            if self.offset_scaled(mid) <= x {
                                lo = mid;
                            } else {
                                hi = mid;
                            }
                        }
                        lo
                    }
                };
                if idx >= n || x >= self.offset_scaled(idx) + self.duration_scaled(idx) {
                    return None;
                }
                Some(idx)
            }

            /// Sample value at X position `x`, if a sample covers it
            pub fn value_at(&self, x: i64) -> Option<$t> {
                self.index_at(x).map(|i| self.value(i))
            }
        }
    };
}

sample_view!(AnalogView, f32);
sample_view!(DigitalView, bool);
