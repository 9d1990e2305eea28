//! Dual-resident typed arrays.
//!
//! An [`AcceleratedBuffer`] holds a logical array that may have a current
//! copy in host memory, in device memory, or both. Writers mark the side
//! they modified; readers call the matching `prepare_for_*_access` first.
//!
//! Allocation failures are reported to the process-wide scratch pool and to
//! any registered memory-pressure handlers before the allocation is retried
//! once.

pub mod pool;

pub use pool::{PoolId, ScratchPool};

use crate::compute::{AllocId, ComputeDevice, DeviceAllocation, DeviceElement};
use crate::error::{MemoryKind, Result, ScopeError};
use std::ops::{Index, IndexMut};
use std::sync::{Arc, Mutex};

/// Whether a side is expected to touch the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessHint {
    #[default]
    Likely,
    Unlikely,
}

/// Where the buffer's storage is expected to live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPlacement {
    /// Pageable host memory only
    PlainHost,
    /// Page-locked host memory with a device mirror
    PinnedHost,
    /// Device memory that is host visible
    Unified,
    /// Device memory; host copy only materialized on demand
    DeviceLocal,
}

impl MemoryPlacement {
    /// Allocation policy for a pair of hints
    pub fn choose(cpu: AccessHint, gpu: AccessHint, unified_available: bool) -> Self {
        match (cpu, gpu) {
            (AccessHint::Likely, AccessHint::Likely) if unified_available => Self::Unified,
            (AccessHint::Likely, AccessHint::Likely) => Self::PinnedHost,
            (AccessHint::Unlikely, AccessHint::Likely) => Self::DeviceLocal,
            (_, AccessHint::Unlikely) => Self::PlainHost,
        }
    }
}

/// Severity of a memory-pressure notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressureLevel {
    /// Memory is getting low
    Soft,
    /// An allocation failed
    Hard,
}

type PressureHandler = Box<dyn Fn(MemoryPressureLevel, MemoryKind, usize) -> bool + Send + Sync>;

static PRESSURE_HANDLERS: Mutex<Vec<PressureHandler>> = Mutex::new(Vec::new());

/// Register a callback invoked when an allocation fails.
///
/// The callback returns `true` if it released memory.
pub fn register_memory_pressure_handler<F>(handler: F)
where
    F: Fn(MemoryPressureLevel, MemoryKind, usize) -> bool + Send + Sync + 'static,
{
    PRESSURE_HANDLERS
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(Box::new(handler));
}

/// Release the global scratch pool, then notify every registered handler.
/// Returns `true` if anything released memory.
pub fn notify_memory_pressure(level: MemoryPressureLevel, kind: MemoryKind, bytes: usize) -> bool {
    let mut freed = ScratchPool::global().on_memory_pressure(level, kind, bytes);
    let handlers = PRESSURE_HANDLERS.lock().unwrap_or_else(|e| e.into_inner());
    for handler in handlers.iter() {
        freed |= handler(level, kind, bytes);
    }
    tracing::debug!(
        "Memory pressure ({:?}, {} memory, {} bytes): freed={}",
        level,
        kind,
        bytes,
        freed
    );
    freed
}

/// Counters for copies between host and device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastWriter {
    Host,
    Device,
}

/// Elements per device allocation granule for buffers likely used on a device
const DEVICE_GRANULE: usize = 256;

/// A typed array resident on host, device, or both
pub struct AcceleratedBuffer<T: DeviceElement> {
    host: Vec<T>,
    /// Host storage dropped while the device copy is authoritative
    host_released: bool,
    len: usize,
    capacity: usize,
    host_valid: bool,
    device: Option<DeviceAllocation>,
    device_valid: bool,
    cpu_hint: AccessHint,
    gpu_hint: AccessHint,
    last_writer: LastWriter,
    transfers: TransferStats,
}

impl<T: DeviceElement> Default for AcceleratedBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeviceElement> std::fmt::Debug for AcceleratedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("host_valid", &self.host_valid)
            .field("device_valid", &self.device_valid)
            .field("placement", &self.placement())
            .finish()
    }
}

impl<T: DeviceElement> AcceleratedBuffer<T> {
    pub fn new() -> Self {
        Self::with_hints(AccessHint::Likely, AccessHint::Unlikely)
    }

    pub fn with_hints(cpu: AccessHint, gpu: AccessHint) -> Self {
        Self {
            host: Vec::new(),
            host_released: false,
            len: 0,
            capacity: 0,
            host_valid: true,
            device: None,
            device_valid: false,
            cpu_hint: cpu,
            gpu_hint: gpu,
            last_writer: LastWriter::Host,
            transfers: TransferStats::default(),
        }
    }

    /// Host-valid buffer holding `values`
    pub fn from_vec(values: Vec<T>) -> Self {
        let mut buf = Self::new();
        buf.len = values.len();
        buf.capacity = values.len();
        buf.host = values;
        buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn host_valid(&self) -> bool {
        self.host_valid
    }

    pub fn device_valid(&self) -> bool {
        self.device_valid
    }

    pub fn has_device_copy(&self) -> bool {
        self.device.is_some()
    }

    pub fn cpu_access_hint(&self) -> AccessHint {
        self.cpu_hint
    }

    pub fn gpu_access_hint(&self) -> AccessHint {
        self.gpu_hint
    }

    pub fn set_cpu_access_hint(&mut self, hint: AccessHint) {
        self.cpu_hint = hint;
    }

    pub fn set_gpu_access_hint(&mut self, hint: AccessHint) {
        self.gpu_hint = hint;
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.transfers
    }

    /// Placement implied by the hints and the attached device, if any
    pub fn placement(&self) -> MemoryPlacement {
        let unified = self
            .device
            .as_ref()
            .is_some_and(|d| d.device().caps().unified_memory);
        MemoryPlacement::choose(self.cpu_hint, self.gpu_hint, unified)
    }

    /// Device allocation backing this buffer, if resident on `device`
    pub(crate) fn device_alloc_id(&self, device: &Arc<ComputeDevice>) -> Option<AllocId> {
        self.device
            .as_ref()
            .filter(|alloc| alloc.is_on(device))
            .map(|alloc| alloc.id())
    }

    fn rounded_capacity(&self, n: usize) -> usize {
        if self.gpu_hint == AccessHint::Likely {
            n.div_ceil(DEVICE_GRANULE) * DEVICE_GRANULE
        } else {
            n
        }
    }

    fn host_oom(elements: usize) -> ScopeError {
        ScopeError::OutOfMemory {
            kind: MemoryKind::Host,
            requested_bytes: elements.saturating_mul(T::SIZE),
        }
    }

    /// Ensure capacity for at least `n` elements
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        if n <= self.capacity {
            return Ok(());
        }
        let new_cap = self.rounded_capacity(n);

        if !self.host_released {
            let extra = new_cap.saturating_sub(self.host.len());
            if self.host.try_reserve_exact(extra).is_err() {
                if !notify_memory_pressure(MemoryPressureLevel::Hard, MemoryKind::Host, extra * T::SIZE)
                    || self.host.try_reserve_exact(extra).is_err()
                {
                    return Err(Self::host_oom(new_cap));
                }
            }
        }

        self.capacity = new_cap;
        if let Some(device) = self.device.as_ref().map(|d| Arc::clone(d.device())) {
            self.ensure_device_allocation(&device)?;
        }
        Ok(())
    }

    /// Change the logical size, keeping the first `min(n, len)` elements.
    ///
    /// Shrinking never frees storage.
    pub fn resize(&mut self, n: usize) -> Result<()> {
        if n > self.capacity {
            self.reserve(n)?;
        }
        if !self.host_released {
            self.host.resize(n, T::default());
        }
        self.len = n;
        Ok(())
    }

    /// Release capacity beyond the logical size
    pub fn shrink_to_fit(&mut self) -> Result<()> {
        if self.capacity == self.len {
            return Ok(());
        }
        self.capacity = self.len;
        self.host.shrink_to_fit();

        if let Some(old) = self.device.take() {
            if self.device_valid && self.len > 0 {
                let device = Arc::clone(old.device());
                let new = Self::allocate_device(&device, self.len * T::SIZE)?;
                device.copy(old.id(), new.id(), self.len * T::SIZE);
                self.device = Some(new);
            } else {
                self.device_valid = false;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.host.clear();
        self.len = 0;
    }

    /// Append on the host side. Requires a current host copy.
    pub fn push(&mut self, value: T) {
        debug_assert!(!self.host_released, "push without prepare_for_cpu_access");
        self.host.push(value);
        self.len += 1;
        self.capacity = self.capacity.max(self.len);
    }

    pub fn extend_from_slice(&mut self, values: &[T]) {
        debug_assert!(!self.host_released, "extend without prepare_for_cpu_access");
        self.host.extend_from_slice(values);
        self.len += values.len();
        self.capacity = self.capacity.max(self.len);
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.host
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.host
    }

    #[inline]
    pub fn get(&self, i: usize) -> Option<&T> {
        self.host.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.host.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.host.clone()
    }

    /// A host write to a buffer whose host storage was released starts from
    /// zeroed storage of the logical length.
    pub fn mark_modified_from_cpu(&mut self) {
        if self.host_released {
            self.host = vec![T::default(); self.len];
            self.host_released = false;
        }
        self.host_valid = true;
        self.device_valid = false;
        self.last_writer = LastWriter::Host;
    }

    pub fn mark_modified_from_gpu(&mut self) {
        self.device_valid = true;
        self.host_valid = false;
        self.last_writer = LastWriter::Device;
        if self.placement() == MemoryPlacement::DeviceLocal && !self.host_released {
            self.host = Vec::new();
            self.host_released = true;
        }
    }

    /// Make the host copy current. Device validity is untouched.
    pub fn prepare_for_cpu_access(&mut self) -> Result<()> {
        if self.host_released {
            let mut host = Vec::new();
            if host.try_reserve_exact(self.capacity).is_err() {
                return Err(Self::host_oom(self.capacity));
            }
            host.resize(self.len, T::default());
            self.host = host;
            self.host_released = false;
        }
        if self.host_valid || self.len == 0 {
            self.host_valid = true;
            return Ok(());
        }

        let Some(alloc) = self.device.as_ref() else {
            // Neither side holds data; host defaults are as good as anything
            self.host_valid = true;
            return Ok(());
        };
        if self.device_valid {
            let bytes = alloc.device().read(alloc.id(), self.len * T::SIZE);
            crate::compute::decode_into(&bytes, &mut self.host[..self.len]);
            self.transfers.device_to_host += 1;
        }
        self.host_valid = true;
        Ok(())
    }

    /// Make the copy on `device` current. Host validity is untouched.
    pub fn prepare_for_gpu_access(&mut self, device: &Arc<ComputeDevice>) -> Result<()> {
        if self.device.as_ref().is_some_and(|d| !d.is_on(device)) {
            // Migrating between devices goes through the host
            self.prepare_for_cpu_access()?;
            self.device = None;
            self.device_valid = false;
        }
        let id = self.ensure_device_allocation(device)?;
        if self.device_valid {
            return Ok(());
        }
        if self.len > 0 && self.host_valid {
            let bytes = crate::compute::encode_slice(&self.host[..self.len]);
            device.write(id, 0, &bytes);
            self.transfers.host_to_device += 1;
        }
        self.device_valid = true;
        Ok(())
    }

    fn allocate_device(device: &Arc<ComputeDevice>, bytes: usize) -> Result<DeviceAllocation> {
        match device.allocate(bytes) {
            Ok(alloc) => Ok(alloc),
            Err(e) if e.is_out_of_memory() => {
                if notify_memory_pressure(MemoryPressureLevel::Hard, MemoryKind::Device, bytes) {
                    device.allocate(bytes)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Ensure a device allocation large enough for the capacity exists,
    /// without transferring data. Existing device contents are preserved.
    pub(crate) fn ensure_device_allocation(&mut self, device: &Arc<ComputeDevice>) -> Result<AllocId> {
        let needed = self.capacity.max(1) * T::SIZE;
        if let Some(alloc) = self.device.as_ref() {
            if alloc.is_on(device) && alloc.size_bytes() >= needed {
                return Ok(alloc.id());
            }
        }

        let new = Self::allocate_device(device, needed)?;
        if let Some(old) = self.device.take() {
            if self.device_valid && old.is_on(device) {
                device.copy(old.id(), new.id(), (self.len * T::SIZE).min(old.size_bytes()));
            } else {
                self.device_valid = false;
            }
        }
        let id = new.id();
        self.device = Some(new);
        Ok(id)
    }

    /// Copy logical contents from `other`.
    ///
    /// Hints of `self` are kept; validity follows the side last written in `other`.
    pub fn copy_from(&mut self, other: &AcceleratedBuffer<T>) -> Result<()> {
        let len = other.len;
        let from_device = other.device_valid
            && (other.last_writer == LastWriter::Device || !other.host_valid);

        match other.device.as_ref() {
            Some(src) if from_device => {
                let device = Arc::clone(src.device());
                self.reserve(len)?;
                if !self.host_released {
                    self.host.resize(len, T::default());
                }
                self.len = len;
                let dst = self.ensure_device_allocation(&device)?;
                device.copy(src.id(), dst, len * T::SIZE);
                self.mark_modified_from_gpu();
            }
            _ => {
                if self.host_released {
                    self.host_released = false;
                    self.host = Vec::new();
                }
                let Some(values) = other.host.get(..len) else {
                    return Err(ScopeError::InvalidInput(format!(
                        "copy source of {} elements has no current host or device copy",
                        len
                    )));
                };
                self.resize(len)?;
                self.host.copy_from_slice(values);
                self.mark_modified_from_cpu();
            }
        }
        Ok(())
    }

    /// Independent copy with the same hints
    pub fn try_clone(&self) -> Result<Self> {
        let mut out = Self::with_hints(self.cpu_hint, self.gpu_hint);
        out.copy_from(self)?;
        Ok(out)
    }
}

impl<T: DeviceElement> Index<usize> for AcceleratedBuffer<T> {
    type Output = T;

    #[inline]
    fn index(&self, i: usize) -> &T {
        &self.host[i]
    }
}

impl<T: DeviceElement> IndexMut<usize> for AcceleratedBuffer<T> {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut T {
        &mut self.host[i]
    }
}

impl<T: DeviceElement> From<Vec<T>> for AcceleratedBuffer<T> {
    fn from(values: Vec<T>) -> Self {
        Self::from_vec(values)
    }
}
