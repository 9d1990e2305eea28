//! Compute devices.
//!
//! Device memory is a separate heap of byte allocations with its own budget,
//! so host/device residency, transfers and allocation failures behave like a
//! discrete accelerator. On the software device, kernels from the
//! [`KernelLibrary`] execute serially against that heap when a command buffer
//! is submitted. With the `wgpu` feature a device can instead run the kernels'
//! WGSL on a GPU adapter, staging the bound allocations through the heap.

use super::command::Command;
use super::kernels::{KernelInvocation, KernelLibrary, KernelSpec};
use crate::error::{MemoryKind, Result, ScopeError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Capabilities reported by a device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCaps {
    /// 64-bit integer arithmetic in kernels
    pub int64: bool,
    /// 64-bit float arithmetic in kernels
    pub float64: bool,
    /// Device memory that is also host visible
    pub unified_memory: bool,
    /// Total device memory in bytes
    pub memory_budget: usize,
    /// Largest supported workgroup (x * y * z)
    pub max_workgroup_size: u32,
    /// Largest workgroup count along one dispatch dimension
    pub max_workgroups: u32,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            int64: true,
            float64: true,
            unified_memory: false,
            memory_budget: 512 * 1024 * 1024,
            max_workgroup_size: 1024,
            max_workgroups: 65535,
        }
    }
}

/// Counters for work done by a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub allocations: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub dispatches: u64,
    pub submissions: u64,
}

#[derive(Default)]
struct StatCounters {
    allocations: AtomicU64,
    uploads: AtomicU64,
    downloads: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    dispatches: AtomicU64,
    submissions: AtomicU64,
}

/// Identifier of one allocation in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocId(pub u64);

#[derive(Default)]
pub(crate) struct DeviceHeap {
    blocks: HashMap<AllocId, Vec<u8>>,
    next_id: u64,
    used: usize,
}

impl DeviceHeap {
    pub(crate) fn take(&mut self, id: AllocId) -> Option<Vec<u8>> {
        self.blocks.remove(&id)
    }

    pub(crate) fn put_back(&mut self, id: AllocId, block: Vec<u8>) {
        self.blocks.insert(id, block);
    }

    pub(crate) fn get(&self, id: AllocId) -> Option<&Vec<u8>> {
        self.blocks.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: AllocId) -> Option<&mut Vec<u8>> {
        self.blocks.get_mut(&id)
    }
}

/// Where dispatches run
pub(crate) enum Executor {
    /// Kernel entry functions on the calling thread
    Software,
    #[cfg(feature = "wgpu")]
    Wgpu(super::wgpu_backend::WgpuExecutor),
}

/// A compute device with its own memory heap and kernel library
pub struct ComputeDevice {
    name: String,
    caps: DeviceCaps,
    heap: Mutex<DeviceHeap>,
    kernels: KernelLibrary,
    executor: Executor,
    stats: StatCounters,
}

impl std::fmt::Debug for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeDevice")
            .field("name", &self.name)
            .field("caps", &self.caps)
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl ComputeDevice {
    /// Software device executing kernels on the host
    pub fn new(name: impl Into<String>, caps: DeviceCaps) -> Arc<Self> {
        Self::with_executor(name.into(), caps, Executor::Software)
    }

    /// Device backed by the default wgpu adapter.
    ///
    /// Capabilities come from the adapter limits; WGSL has no 64-bit types, so
    /// `int64` and `float64` are always off.
    #[cfg(feature = "wgpu")]
    pub fn open_wgpu(memory_budget: usize) -> Result<Arc<Self>> {
        let (name, caps, executor) = super::wgpu_backend::WgpuExecutor::open(memory_budget)?;
        Ok(Self::with_executor(name, caps, Executor::Wgpu(executor)))
    }

    fn with_executor(name: String, caps: DeviceCaps, executor: Executor) -> Arc<Self> {
        let device = Self {
            name,
            caps,
            heap: Mutex::new(DeviceHeap::default()),
            kernels: KernelLibrary::builtin(),
            executor,
            stats: StatCounters::default(),
        };
        tracing::info!(
            "Compute device '{}' ready ({}): int64={} fp64={} unified={} budget={} bytes",
            device.name,
            device.backend_name(),
            device.caps.int64,
            device.caps.float64,
            device.caps.unified_memory,
            device.caps.memory_budget
        );
        Arc::new(device)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.executor {
            Executor::Software => "software",
            #[cfg(feature = "wgpu")]
            Executor::Wgpu(_) => "wgpu",
        }
    }

    /// Whether this device's backend can execute `kernel`
    #[cfg_attr(not(feature = "wgpu"), allow(unused_variables))]
    pub fn can_execute(&self, kernel: &KernelSpec) -> bool {
        match &self.executor {
            Executor::Software => true,
            #[cfg(feature = "wgpu")]
            Executor::Wgpu(_) => kernel.wgsl.is_some(),
        }
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn kernels(&self) -> &KernelLibrary {
        &self.kernels
    }

    /// Bytes currently allocated
    pub fn memory_used(&self) -> usize {
        self.lock_heap().used
    }

    pub fn stats(&self) -> DeviceStats {
        let s = &self.stats;
        DeviceStats {
            allocations: s.allocations.load(Ordering::Relaxed),
            uploads: s.uploads.load(Ordering::Relaxed),
            downloads: s.downloads.load(Ordering::Relaxed),
            bytes_uploaded: s.bytes_uploaded.load(Ordering::Relaxed),
            bytes_downloaded: s.bytes_downloaded.load(Ordering::Relaxed),
            dispatches: s.dispatches.load(Ordering::Relaxed),
            submissions: s.submissions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn lock_heap(&self) -> MutexGuard<'_, DeviceHeap> {
        // A panicking kernel leaves the heap structurally intact
        self.heap.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate `bytes` of zeroed device memory
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<DeviceAllocation> {
        let mut heap = self.lock_heap();
        if heap.used.saturating_add(bytes) > self.caps.memory_budget {
            tracing::debug!(
                "Device '{}' allocation of {} bytes exceeds budget ({} of {} used)",
                self.name,
                bytes,
                heap.used,
                self.caps.memory_budget
            );
            return Err(ScopeError::OutOfMemory {
                kind: MemoryKind::Device,
                requested_bytes: bytes,
            });
        }
        let id = AllocId(heap.next_id);
        heap.next_id += 1;
        heap.used += bytes;
        heap.blocks.insert(id, vec![0u8; bytes]);
        self.stats.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceAllocation {
            id,
            bytes,
            device: Arc::clone(self),
        })
    }

    fn release(&self, id: AllocId, bytes: usize) {
        let mut heap = self.lock_heap();
        if heap.blocks.remove(&id).is_some() {
            heap.used = heap.used.saturating_sub(bytes);
        }
    }

    /// Host → device copy into an allocation
    pub(crate) fn write(&self, id: AllocId, offset: usize, data: &[u8]) {
        let mut heap = self.lock_heap();
        if let Some(block) = heap.get_mut(id) {
            let end = (offset + data.len()).min(block.len());
            if end > offset {
                block[offset..end].copy_from_slice(&data[..end - offset]);
            }
        }
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_uploaded
            .fetch_add(data.len() as u64, Ordering::Relaxed);
    }

    /// Device → host copy of the first `len` bytes of an allocation
    pub(crate) fn read(&self, id: AllocId, len: usize) -> Vec<u8> {
        let heap = self.lock_heap();
        let out = heap
            .get(id)
            .map(|block| block[..len.min(block.len())].to_vec())
            .unwrap_or_default();
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_downloaded
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    /// Device-side copy of `len` bytes between allocations
    pub(crate) fn copy(&self, src: AllocId, dst: AllocId, len: usize) {
        let mut heap = self.lock_heap();
        let Some(data) = heap.get(src).map(|b| b[..len.min(b.len())].to_vec()) else {
            return;
        };
        if let Some(block) = heap.get_mut(dst) {
            let n = data.len().min(block.len());
            block[..n].copy_from_slice(&data[..n]);
        }
    }

    pub(crate) fn count_dispatch(&self) {
        self.stats.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    /// Run recorded commands in order and wait for them to finish
    pub(crate) fn execute(&self, commands: Vec<Command>) -> Result<()> {
        match &self.executor {
            Executor::Software => commands
                .into_iter()
                .try_for_each(|command| self.execute_on_host(command)),
            #[cfg(feature = "wgpu")]
            Executor::Wgpu(gpu) => {
                let mut heap = self.lock_heap();
                let dispatches = gpu.execute(&mut heap, commands)?;
                self.stats.dispatches.fetch_add(dispatches, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    fn execute_on_host(&self, command: Command) -> Result<()> {
        match command {
            // Execution is serial, so descriptor updates and barriers are ordering markers only
            Command::BindDescriptor { .. } | Command::Barrier => Ok(()),
            Command::Dispatch {
                kernel,
                bindings,
                push,
                groups,
            } => {
                let mut heap = self.lock_heap();
                let mut blocks = Vec::with_capacity(bindings.len());
                for &id in &bindings {
                    match heap.take(id) {
                        Some(block) => blocks.push(block),
                        None => {
                            for (&taken, block) in bindings.iter().zip(blocks) {
                                heap.put_back(taken, block);
                            }
                            return Err(ScopeError::InvalidParameter(format!(
                                "kernel '{}' bound to a missing or aliased allocation {:?}",
                                kernel.name, id
                            )));
                        }
                    }
                }

                let global_size = [
                    groups[0] * kernel.local_size[0],
                    groups[1] * kernel.local_size[1],
                    groups[2] * kernel.local_size[2],
                ];
                let mut inv = KernelInvocation {
                    push: &push,
                    buffers: &mut blocks,
                    global_size,
                };
                (kernel.entry)(&mut inv);
                self.count_dispatch();

                for (&id, block) in bindings.iter().zip(blocks) {
                    heap.put_back(id, block);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn count_submission(&self) {
        self.stats.submissions.fetch_add(1, Ordering::Relaxed);
    }
}

/// An owned region of device memory, released on drop
pub struct DeviceAllocation {
    id: AllocId,
    bytes: usize,
    device: Arc<ComputeDevice>,
}

impl DeviceAllocation {
    pub fn id(&self) -> AllocId {
        self.id
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes
    }

    pub fn device(&self) -> &Arc<ComputeDevice> {
        &self.device
    }

    pub fn is_on(&self, device: &Arc<ComputeDevice>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }
}

impl std::fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceAllocation({:?}, {} bytes)", self.id, self.bytes)
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.device.release(self.id, self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device(budget: usize) -> Arc<ComputeDevice> {
        ComputeDevice::new(
            "test",
            DeviceCaps {
                memory_budget: budget,
                ..DeviceCaps::default()
            },
        )
    }

    #[test]
    fn test_allocation_respects_budget() {
        let dev = small_device(1024);
        let a = dev.allocate(800).unwrap();
        assert_eq!(dev.memory_used(), 800);

        let err = dev.allocate(400).unwrap_err();
        assert!(err.is_out_of_memory());

        drop(a);
        assert_eq!(dev.memory_used(), 0);
        assert!(dev.allocate(400).is_ok());
    }

    #[test]
    fn test_write_read_and_copy() {
        let dev = small_device(1024);
        let a = dev.allocate(8).unwrap();
        let b = dev.allocate(8).unwrap();
        dev.write(a.id(), 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        dev.copy(a.id(), b.id(), 8);
        assert_eq!(dev.read(b.id(), 4), vec![1, 2, 3, 4]);

        let stats = dev.stats();
        assert_eq!(stats.uploads, 1);
        assert_eq!(stats.bytes_uploaded, 8);
        assert_eq!(stats.downloads, 1);
        assert_eq!(stats.bytes_downloaded, 4);
    }
}
