//! GPU execution through wgpu.
//!
//! The device heap stays authoritative for host transfers. A submission
//! uploads each allocation its dispatches bind the first time it is used,
//! encodes every dispatch into one command encoder and copies the bound
//! allocations back into the heap before returning. WGSL is f32-only.

use super::command::Command;
use super::device::{AllocId, DeviceCaps, DeviceHeap};
use super::kernels::KernelSpec;
use crate::error::{Result, ScopeError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wgpu::util::DeviceExt;

/// Uniform blocks are padded to this many bytes
const UNIFORM_ALIGN: usize = 16;

pub(crate) struct WgpuExecutor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Mutex<HashMap<&'static str, Arc<wgpu::ComputePipeline>>>,
}

/// A storage buffer mirroring one heap allocation for one submission
struct Resident {
    buffer: wgpu::Buffer,
    size: u64,
}

fn padded(bytes: &[u8], align: usize) -> Vec<u8> {
    let len = bytes.len().max(1).div_ceil(align) * align;
    let mut out = bytes.to_vec();
    out.resize(len, 0);
    out
}

impl WgpuExecutor {
    /// Open the default high-performance adapter
    pub(crate) fn open(memory_budget: usize) -> Result<(String, DeviceCaps, Self)> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: None,
        }))
        .ok_or_else(|| ScopeError::Unsupported("no wgpu adapter available".to_string()))?;

        let info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("scopeflow"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| ScopeError::Unsupported(format!("wgpu device request failed: {}", e)))?;

        tracing::info!(
            "wgpu adapter '{}' ({:?}, {:?})",
            info.name,
            info.backend,
            info.device_type
        );
        let caps = DeviceCaps {
            int64: false,
            float64: false,
            unified_memory: info.device_type == wgpu::DeviceType::IntegratedGpu,
            memory_budget,
            max_workgroup_size: limits.max_compute_invocations_per_workgroup,
            max_workgroups: limits.max_compute_workgroups_per_dimension,
        };
        let executor = Self {
            device,
            queue,
            pipelines: Mutex::new(HashMap::new()),
        };
        Ok((info.name, caps, executor))
    }

    fn pipeline(&self, kernel: &KernelSpec) -> Result<Arc<wgpu::ComputePipeline>> {
        let source = kernel.wgsl.ok_or_else(|| {
            ScopeError::Unsupported(format!("kernel '{}' has no WGSL source", kernel.name))
        })?;
        let mut cache = self.pipelines.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pipeline) = cache.get(kernel.name) {
            return Ok(Arc::clone(pipeline));
        }

        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(kernel.name),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let pipeline = Arc::new(self.device.create_compute_pipeline(
            &wgpu::ComputePipelineDescriptor {
                label: Some(kernel.name),
                layout: None,
                module: &module,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            },
        ));
        tracing::debug!("Compiled WGSL kernel '{}'", kernel.name);
        cache.insert(kernel.name, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Run `commands` against the allocations in `heap`.
    ///
    /// Returns the number of dispatches executed.
    pub(crate) fn execute(&self, heap: &mut DeviceHeap, commands: Vec<Command>) -> Result<u64> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let submitted = self.encode_and_submit(heap, commands);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let (dispatches, readbacks) = submitted?;
        if let Some(error) = validation {
            return Err(ScopeError::Unsupported(format!("wgpu rejected submission: {}", error)));
        }

        for (id, staging) in readbacks {
            let bytes = self.map_read(&staging)?;
            if let Some(block) = heap.get_mut(id) {
                let n = block.len().min(bytes.len());
                block[..n].copy_from_slice(&bytes[..n]);
            }
        }
        Ok(dispatches)
    }

    fn encode_and_submit(
        &self,
        heap: &DeviceHeap,
        commands: Vec<Command>,
    ) -> Result<(u64, Vec<(AllocId, wgpu::Buffer)>)> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("scopeflow submission"),
            });
        let mut resident: HashMap<AllocId, Resident> = HashMap::new();
        let mut dispatches = 0u64;

        for command in commands {
            // wgpu orders passes within an encoder, so barriers need no work
            let Command::Dispatch {
                kernel,
                bindings,
                push,
                groups,
            } = command
            else {
                continue;
            };
            let pipeline = self.pipeline(&kernel)?;

            for &id in &bindings {
                if resident.contains_key(&id) {
                    continue;
                }
                let block = heap.get(id).ok_or_else(|| {
                    ScopeError::InvalidParameter(format!(
                        "kernel '{}' bound to a missing allocation {:?}",
                        kernel.name, id
                    ))
                })?;
                let contents = padded(block, 4);
                let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("scopeflow storage"),
                    contents: &contents,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                });
                resident.insert(
                    id,
                    Resident {
                        buffer,
                        size: contents.len() as u64,
                    },
                );
            }

            let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(kernel.name),
                contents: &padded(&push, UNIFORM_ALIGN),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let mut entries = Vec::with_capacity(bindings.len() + 1);
            for (slot, id) in bindings.iter().enumerate() {
                let Some(r) = resident.get(id) else {
                    continue;
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: slot as u32,
                    resource: r.buffer.as_entire_binding(),
                });
            }
            entries.push(wgpu::BindGroupEntry {
                binding: bindings.len() as u32,
                resource: uniform.as_entire_binding(),
            });
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(kernel.name),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            });

            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(kernel.name),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
            }
            dispatches += 1;
        }

        let mut readbacks = Vec::with_capacity(resident.len());
        for (id, r) in &resident {
            let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("scopeflow readback"),
                size: r.size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            encoder.copy_buffer_to_buffer(&r.buffer, 0, &staging, 0, r.size);
            readbacks.push((*id, staging));
        }
        self.queue.submit(Some(encoder.finish()));
        Ok((dispatches, readbacks))
    }

    fn map_read(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
        let slice = buffer.slice(..);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| ScopeError::Transport("wgpu device lost during readback".to_string()))?
            .map_err(|e| ScopeError::Transport(format!("wgpu readback failed: {}", e)))?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AcceleratedBuffer;
    use crate::compute::kernels::{ToneTurnsPush, TONE, TONE_F32};
    use crate::compute::{CommandBuffer, ComputeDevice, ComputePipeline, Queue};

    fn gpu() -> Option<Arc<ComputeDevice>> {
        match ComputeDevice::open_wgpu(256 * 1024 * 1024) {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("skipping: {}", e);
                None
            }
        }
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded(&[], 4), vec![0, 0, 0, 0]);
        assert_eq!(padded(&[1, 2, 3, 4, 5], 4).len(), 8);
        assert_eq!(padded(&[7; 20], UNIFORM_ALIGN).len(), 32);
    }

    #[test]
    fn test_adapter_reports_f32_only() {
        let Some(dev) = gpu() else { return };
        assert_eq!(dev.backend_name(), "wgpu");
        assert!(!dev.caps().float64);
        assert!(ComputePipeline::new(&dev, TONE).is_err());
        assert!(ComputePipeline::new(&dev, TONE_F32).is_ok());
    }

    #[test]
    fn test_tone_on_adapter() {
        let Some(dev) = gpu() else { return };
        let queue = Queue::new(Arc::clone(&dev));
        let mut pipe = ComputePipeline::new(&dev, TONE_F32).unwrap();
        let mut cmd = CommandBuffer::new();

        let mut out: AcceleratedBuffer<f32> = AcceleratedBuffer::new();
        out.resize(100).unwrap();
        pipe.bind_buffer(0, &mut out, &mut cmd, true).unwrap();
        let push = ToneTurnsPush::new(0.01, 0.0, 1.0, 0.5, 100);
        pipe.dispatch(&mut cmd, &push, pipe.groups_for(100), 1, 1).unwrap();
        queue.submit_and_block(&mut cmd).unwrap();
        out.mark_modified_from_gpu();
        out.prepare_for_cpu_access().unwrap();

        assert!((out[0] - 0.5).abs() < 1e-4);
        assert!((out[25] - 1.5).abs() < 1e-4);
        assert_eq!(dev.stats().dispatches, 1);
    }
}
