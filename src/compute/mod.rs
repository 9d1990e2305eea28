//! Compute dispatch layer.
//!
//! A [`ComputeContext`] is handed to every filter refresh. When it carries a
//! device, filters that implement a kernel record dispatches through a
//! [`ComputePipeline`] and submit them on the context's [`Queue`]; otherwise
//! they run their CPU reference implementation.
//!
//! Devices are software-emulated by default. Building with the `wgpu` feature
//! adds a GPU backend selected through [`ComputeBackend::Wgpu`].

mod command;
mod device;
mod element;
pub mod kernels;
mod pipeline;
#[cfg(feature = "wgpu")]
mod wgpu_backend;

pub use command::{CommandBuffer, Queue};
pub use device::{AllocId, ComputeDevice, DeviceAllocation, DeviceCaps, DeviceStats};
pub use element::{decode_into, encode_slice, DeviceElement};
pub use kernels::{KernelLibrary, KernelSpec, PushConstants};
pub use pipeline::ComputePipeline;

use crate::config::{ComputeBackend, ComputeConfig};
use std::sync::Arc;

/// Device and queue available to filters, if any
#[derive(Debug, Default)]
pub struct ComputeContext {
    queue: Option<Queue>,
}

impl ComputeContext {
    /// No device: every filter takes its CPU path
    pub fn cpu_only() -> Self {
        Self { queue: None }
    }

    pub fn with_device(device: Arc<ComputeDevice>) -> Self {
        Self {
            queue: Some(Queue::new(device)),
        }
    }

    pub fn from_config(config: &ComputeConfig) -> Self {
        if !config.enable_device {
            tracing::info!("Compute device disabled; using CPU implementations");
            return Self::cpu_only();
        }
        let memory_budget = config.memory_budget_mb.saturating_mul(1024 * 1024);
        if config.backend == ComputeBackend::Wgpu {
            if let Some(device) = open_gpu(memory_budget) {
                return Self::with_device(device);
            }
        }
        let caps = DeviceCaps {
            int64: config.int64,
            float64: config.float64,
            unified_memory: config.unified_memory,
            memory_budget,
            ..DeviceCaps::default()
        };
        Self::with_device(ComputeDevice::new(config.device_name.clone(), caps))
    }

    pub fn has_device(&self) -> bool {
        self.queue.is_some()
    }

    pub fn device(&self) -> Option<&Arc<ComputeDevice>> {
        self.queue.as_ref().map(Queue::device)
    }

    pub fn queue(&self) -> Option<&Queue> {
        self.queue.as_ref()
    }

    /// Build a pipeline for `kernel` if a capable device exists
    pub fn pipeline(&self, kernel: &str) -> Option<ComputePipeline> {
        let device = self.device()?;
        match ComputePipeline::new(device, kernel) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::debug!("Falling back to CPU for '{}': {}", kernel, e);
                None
            }
        }
    }
}

#[cfg(feature = "wgpu")]
fn open_gpu(memory_budget: usize) -> Option<Arc<ComputeDevice>> {
    match ComputeDevice::open_wgpu(memory_budget) {
        Ok(device) => Some(device),
        Err(e) => {
            tracing::warn!("GPU backend unavailable, using software device: {}", e);
            None
        }
    }
}

#[cfg(not(feature = "wgpu"))]
fn open_gpu(_memory_budget: usize) -> Option<Arc<ComputeDevice>> {
    tracing::warn!("Built without the wgpu feature; using software device");
    None
}
