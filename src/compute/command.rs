//! Command recording and submission.

use super::device::{AllocId, ComputeDevice, DeviceAllocation};
use super::kernels::KernelSpec;
use crate::error::Result;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub(crate) enum Command {
    BindDescriptor {
        slot: usize,
        alloc: AllocId,
    },
    Dispatch {
        kernel: KernelSpec,
        bindings: Vec<AllocId>,
        push: Vec<u8>,
        groups: [u32; 3],
    },
    Barrier,
}

/// A list of recorded device commands plus the transient allocations they use
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    transients: Vec<DeviceAllocation>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Barrier))
            .count()
    }

    /// Drop recorded commands and release transient allocations
    pub fn reset(&mut self) {
        self.commands.clear();
        self.transients.clear();
    }

    pub(crate) fn record(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn keep_alive(&mut self, alloc: DeviceAllocation) {
        self.transients.push(alloc);
    }
}

/// Submission queue of a device. Submissions are serialized.
pub struct Queue {
    device: Arc<ComputeDevice>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Queue({})", self.device.name())
    }
}

impl Queue {
    pub fn new(device: Arc<ComputeDevice>) -> Self {
        Self {
            device,
            lock: Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<ComputeDevice> {
        &self.device
    }

    /// Execute every command in `cmd` and wait for completion.
    ///
    /// The command buffer is left empty.
    pub fn submit_and_block(&self, cmd: &mut CommandBuffer) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.device.count_submission();

        let commands = std::mem::take(&mut cmd.commands);
        let result = self.device.execute(commands);
        cmd.transients.clear();
        result
    }
}
