//! Process-wide cache of reusable scratch buffers.
//!
//! Buffers are keyed by element type and [`PoolId`]. A buffer handed out by
//! [`ScratchPool::allocate`] belongs to the caller until it is given back with
//! [`ScratchPool::free`]; the pool never touches its contents.

use super::{AccessHint, AcceleratedBuffer, MemoryPressureLevel};
use crate::compute::DeviceElement;
use crate::error::MemoryKind;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

/// Identifier of one free list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub u16);

impl PoolId {
    /// General host-side temporaries
    pub const SCRATCH: PoolId = PoolId(0);
    /// FFT input/output staging
    pub const FFT: PoolId = PoolId(1);
    /// Temporaries shared between host and device
    pub const DEVICE_STAGING: PoolId = PoolId(2);
}

#[derive(Debug, Clone, Copy)]
struct PoolHints {
    cpu: AccessHint,
    gpu: AccessHint,
}

#[derive(Default)]
struct PoolInner {
    pools: HashMap<PoolId, PoolHints>,
    free: HashMap<(TypeId, PoolId), Vec<Box<dyn Any + Send>>>,
}

impl PoolInner {
    fn cached_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }
}

/// Statistics of a pool instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub cached: usize,
    pub pools: usize,
}

pub struct ScratchPool {
    inner: Mutex<PoolInner>,
}

static GLOBAL_POOL: OnceLock<ScratchPool> = OnceLock::new();

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ScratchPool {
    /// Pool with the built-in ids registered
    pub fn new() -> Self {
        let pool = Self {
            inner: Mutex::new(PoolInner::default()),
        };
        pool.register_pool(PoolId::SCRATCH, AccessHint::Likely, AccessHint::Unlikely);
        pool.register_pool(PoolId::FFT, AccessHint::Likely, AccessHint::Unlikely);
        pool.register_pool(PoolId::DEVICE_STAGING, AccessHint::Likely, AccessHint::Likely);
        pool
    }

    /// The process-wide pool. [`super::notify_memory_pressure`] always drains it.
    pub fn global() -> &'static ScratchPool {
        GLOBAL_POOL.get_or_init(ScratchPool::new)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a pool id with the hints fresh buffers receive
    pub fn register_pool(&self, id: PoolId, cpu: AccessHint, gpu: AccessHint) {
        self.lock().pools.insert(id, PoolHints { cpu, gpu });
    }

    pub fn is_registered(&self, id: PoolId) -> bool {
        self.lock().pools.contains_key(&id)
    }

    /// Take a buffer from the free list, or build a fresh one
    pub fn allocate<T: DeviceElement>(&self, id: PoolId) -> AcceleratedBuffer<T> {
        let mut inner = self.lock();
        let Some(hints) = inner.pools.get(&id).copied() else {
            tracing::error!("allocate from unregistered scratch pool {:?}", id);
            return AcceleratedBuffer::new();
        };

        if let Some(list) = inner.free.get_mut(&(TypeId::of::<T>(), id)) {
            while let Some(boxed) = list.pop() {
                if let Ok(buf) = boxed.downcast::<AcceleratedBuffer<T>>() {
                    return *buf;
                }
            }
        }
        AcceleratedBuffer::with_hints(hints.cpu, hints.gpu)
    }

    /// Return a buffer to its free list. Unknown ids drop the buffer.
    pub fn free<T: DeviceElement>(&self, buffer: AcceleratedBuffer<T>, id: PoolId) {
        let mut inner = self.lock();
        if !inner.pools.contains_key(&id) {
            tracing::error!("free to unregistered scratch pool {:?}; dropping buffer", id);
            return;
        }
        inner
            .free
            .entry((TypeId::of::<T>(), id))
            .or_default()
            .push(Box::new(buffer));
    }

    /// Drop every cached buffer. Returns `true` if anything was released.
    pub fn on_memory_pressure(
        &self,
        level: MemoryPressureLevel,
        kind: MemoryKind,
        requested_bytes: usize,
    ) -> bool {
        let dropped: Vec<Box<dyn Any + Send>> = {
            let mut inner = self.lock();
            inner.free.drain().flat_map(|(_, list)| list).collect()
        };
        if dropped.is_empty() {
            return false;
        }
        tracing::info!(
            "Scratch pool released {} buffers ({:?} pressure on {} memory, {} bytes requested)",
            dropped.len(),
            level,
            kind,
            requested_bytes
        );
        true
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            cached: inner.cached_count(),
            pools: inner.pools.len(),
        }
    }
}
