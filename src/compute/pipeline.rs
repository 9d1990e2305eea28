//! One precompiled kernel with its bindings.

use super::command::{Command, CommandBuffer};
use super::device::{AllocId, ComputeDevice};
use super::element::{encode_slice, DeviceElement};
use super::kernels::{KernelSpec, PushConstants};
use crate::buffer::AcceleratedBuffer;
use crate::error::{Result, ScopeError};
use std::sync::Arc;

pub struct ComputePipeline {
    device: Arc<ComputeDevice>,
    kernel: KernelSpec,
    bindings: Vec<Option<AllocId>>,
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("kernel", &self.kernel.name)
            .field("bindings", &self.bindings)
            .finish()
    }
}

impl ComputePipeline {
    /// Look up `kernel` in the device library.
    ///
    /// Fails with [`ScopeError::Unsupported`] if the kernel is unknown or needs a
    /// capability the device lacks; callers fall back to the CPU path.
    pub fn new(device: &Arc<ComputeDevice>, kernel: &str) -> Result<Self> {
        let spec = device
            .kernels()
            .get(kernel)
            .cloned()
            .ok_or_else(|| ScopeError::Unsupported(format!("kernel '{}' not in library", kernel)))?;

        let caps = device.caps();
        if spec.requires_int64 && !caps.int64 {
            return Err(ScopeError::Unsupported(format!(
                "kernel '{}' needs 64-bit integers",
                kernel
            )));
        }
        if spec.requires_fp64 && !caps.float64 {
            return Err(ScopeError::Unsupported(format!(
                "kernel '{}' needs 64-bit floats",
                kernel
            )));
        }
        if !device.can_execute(&spec) {
            return Err(ScopeError::Unsupported(format!(
                "kernel '{}' has no shader for the {} backend",
                kernel,
                device.backend_name()
            )));
        }

        Ok(Self {
            device: Arc::clone(device),
            bindings: vec![None; spec.bindings],
            kernel: spec,
        })
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name
    }

    /// Workgroups needed to cover `count` invocations along X
    pub fn groups_for(&self, count: usize) -> u32 {
        let local = self.kernel.local_size[0].max(1) as usize;
        count.div_ceil(local).max(1) as u32
    }

    /// Whether `count` invocations fit in one dispatch along X
    pub fn fits(&self, count: usize) -> bool {
        let local = self.kernel.local_size[0].max(1) as usize;
        count.div_ceil(local) <= self.device.caps().max_workgroups as usize
    }

    fn check_slot(&self, index: usize) -> Result<()> {
        if index >= self.bindings.len() {
            return Err(ScopeError::InvalidParameter(format!(
                "kernel '{}' has {} bindings, not {}",
                self.kernel.name,
                self.bindings.len(),
                index + 1
            )));
        }
        Ok(())
    }

    /// Make `buffer` resident on the device and bind it to slot `index`.
    ///
    /// With `output_only` the device storage is allocated but nothing is
    /// uploaded; the caller marks the buffer modified from the GPU afterwards.
    pub fn bind_buffer<T: DeviceElement>(
        &mut self,
        index: usize,
        buffer: &mut AcceleratedBuffer<T>,
        cmd: &mut CommandBuffer,
        output_only: bool,
    ) -> Result<()> {
        self.check_slot(index)?;
        let alloc = if output_only {
            buffer.ensure_device_allocation(&self.device)?
        } else {
            buffer.prepare_for_gpu_access(&self.device)?;
            buffer.device_alloc_id(&self.device).ok_or_else(|| {
                ScopeError::Unsupported("buffer has no device allocation".to_string())
            })?
        };
        self.bindings[index] = Some(alloc);
        cmd.record(Command::BindDescriptor { slot: index, alloc });
        Ok(())
    }

    /// Bind a read-only input without mutating it.
    ///
    /// If the buffer has no current copy on this device, its host contents are
    /// staged through a transient allocation owned by `cmd`.
    pub fn bind_input<T: DeviceElement>(
        &mut self,
        index: usize,
        buffer: &AcceleratedBuffer<T>,
        cmd: &mut CommandBuffer,
    ) -> Result<()> {
        self.check_slot(index)?;
        let alloc = match buffer.device_alloc_id(&self.device) {
            Some(id) if buffer.device_valid() => id,
            _ => {
                if !buffer.host_valid() {
                    return Err(ScopeError::InvalidInput(
                        "input buffer has no current copy on this device or the host".to_string(),
                    ));
                }
                let bytes = encode_slice(buffer.as_slice());
                let staging = self.device.allocate(bytes.len().max(1))?;
                self.device.write(staging.id(), 0, &bytes);
                let id = staging.id();
                cmd.keep_alive(staging);
                id
            }
        };
        self.bindings[index] = Some(alloc);
        cmd.record(Command::BindDescriptor { slot: index, alloc });
        Ok(())
    }

    /// Record a dispatch of `x * y * z` workgroups with the given push constants
    pub fn dispatch<P: PushConstants>(
        &mut self,
        cmd: &mut CommandBuffer,
        push: &P,
        x: u32,
        y: u32,
        z: u32,
    ) -> Result<()> {
        let bindings = self
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                b.ok_or_else(|| {
                    ScopeError::InvalidParameter(format!(
                        "kernel '{}' binding {} not set",
                        self.kernel.name, i
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let push = push.to_bytes();
        if push.len() != self.kernel.push_size {
            return Err(ScopeError::InvalidParameter(format!(
                "kernel '{}' expects {} bytes of push constants, got {}",
                self.kernel.name,
                self.kernel.push_size,
                push.len()
            )));
        }

        let workgroup: u32 = self.kernel.local_size.iter().product();
        if workgroup > self.device.caps().max_workgroup_size {
            return Err(ScopeError::Unsupported(format!(
                "kernel '{}' workgroup of {} exceeds device limit",
                self.kernel.name, workgroup
            )));
        }

        let limit = self.device.caps().max_workgroups;
        if [x, y, z].iter().any(|&n| n > limit) {
            return Err(ScopeError::Unsupported(format!(
                "kernel '{}' dispatch of {}x{}x{} groups exceeds device limit {}",
                self.kernel.name, x, y, z, limit
            )));
        }

        cmd.record(Command::Dispatch {
            kernel: self.kernel.clone(),
            bindings,
            push,
            groups: [x, y.max(1), z.max(1)],
        });
        Ok(())
    }

    /// Order a following dispatch after the writes of the previous one
    pub fn add_compute_memory_barrier(cmd: &mut CommandBuffer) {
        cmd.record(Command::Barrier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::kernels::{EmphasisPush, TonePush, EMPHASIS, TONE};
    use crate::compute::{DeviceCaps, Queue};

    #[test]
    fn test_missing_capability_is_unsupported() {
        let dev = ComputeDevice::new(
            "no-fp64",
            DeviceCaps {
                float64: false,
                ..DeviceCaps::default()
            },
        );
        let err = ComputePipeline::new(&dev, TONE).unwrap_err();
        assert!(matches!(err, ScopeError::Unsupported(_)));
        assert!(ComputePipeline::new(&dev, EMPHASIS).is_ok());
    }

    #[test]
    fn test_workgroup_count_limit() {
        let dev = ComputeDevice::new(
            "small-grid",
            DeviceCaps {
                max_workgroups: 4,
                ..DeviceCaps::default()
            },
        );
        let mut pipe = ComputePipeline::new(&dev, EMPHASIS).unwrap();
        assert!(pipe.fits(256));
        assert!(!pipe.fits(257));

        let mut cmd = CommandBuffer::new();
        let input = AcceleratedBuffer::from_vec(vec![0f32; 512]);
        let mut output: AcceleratedBuffer<f32> = AcceleratedBuffer::new();
        output.resize(512).unwrap();
        pipe.bind_input(0, &input, &mut cmd).unwrap();
        pipe.bind_buffer(1, &mut output, &mut cmd, true).unwrap();
        let push = EmphasisPush {
            count: 512,
            samples_per_tap: 0,
            c: 1.0,
            p: 0.0,
            scale: 1.0,
        };
        let err = pipe.dispatch(&mut cmd, &push, pipe.groups_for(512), 1, 1).unwrap_err();
        assert!(matches!(err, ScopeError::Unsupported(_)));
        assert_eq!(cmd.dispatch_count(), 0);
    }

    #[test]
    fn test_unknown_kernel() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        assert!(ComputePipeline::new(&dev, "does-not-exist").is_err());
    }

    #[test]
    fn test_dispatch_requires_all_bindings() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let mut pipe = ComputePipeline::new(&dev, EMPHASIS).unwrap();
        let mut cmd = CommandBuffer::new();
        let input = AcceleratedBuffer::from_vec(vec![0f32; 8]);
        pipe.bind_input(0, &input, &mut cmd).unwrap();

        let push = EmphasisPush {
            count: 8,
            samples_per_tap: 0,
            c: 1.0,
            p: 0.0,
            scale: 1.0,
        };
        assert!(pipe.dispatch(&mut cmd, &push, 1, 1, 1).is_err());
    }

    #[test]
    fn test_tone_dispatch_round_trip() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let queue = Queue::new(Arc::clone(&dev));
        let mut pipe = ComputePipeline::new(&dev, TONE).unwrap();
        let mut cmd = CommandBuffer::new();

        let mut out: AcceleratedBuffer<f32> = AcceleratedBuffer::new();
        out.resize(100).unwrap();
        pipe.bind_buffer(0, &mut out, &mut cmd, true).unwrap();
        let push = TonePush {
            radians_per_sample: std::f64::consts::PI / 50.0,
            start_phase: 0.0,
            half_amplitude: 1.0,
            bias: 0.5,
            count: 100,
        };
        let groups = pipe.groups_for(100);
        pipe.dispatch(&mut cmd, &push, groups, 1, 1).unwrap();
        assert_eq!(cmd.dispatch_count(), 1);

        queue.submit_and_block(&mut cmd).unwrap();
        assert!(cmd.is_empty());
        out.mark_modified_from_gpu();
        out.prepare_for_cpu_access().unwrap();

        assert!((out[0] - 0.5).abs() < 1e-6);
        assert!((out[25] - 1.5).abs() < 1e-6);
        assert_eq!(dev.stats().dispatches, 1);
    }

    #[test]
    fn test_bind_input_stages_host_data() {
        let dev = ComputeDevice::new("dev", DeviceCaps::default());
        let mut pipe = ComputePipeline::new(&dev, EMPHASIS).unwrap();
        let mut cmd = CommandBuffer::new();
        let input = AcceleratedBuffer::from_vec(vec![1f32; 32]);

        let before = dev.memory_used();
        pipe.bind_input(0, &input, &mut cmd).unwrap();
        assert!(dev.memory_used() > before);
        assert!(!input.device_valid());

        cmd.reset();
        assert_eq!(dev.memory_used(), before);
    }
}
