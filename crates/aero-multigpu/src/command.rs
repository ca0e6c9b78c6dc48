//! Device-local command recording.
//!
//! A [`CommandRecorder`] is bound to one device when it is created and turns into an immutable
//! [`CommandBuffer`] when recording ends. The buffer remembers its device so a submission
//! against any other device is rejected.

use std::sync::Arc;

use crate::{DeviceIndex, FrameRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandBufferId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuCommand {
    /// Rasterize the part of the frame covered by `region`.
    Draw {
        region: FrameRegion,
        estimated_cost: u32,
    },
    Dispatch {
        groups: [u32; 3],
        estimated_cost: u32,
    },
    /// Debug label; carries no work.
    Marker(String),
}

impl GpuCommand {
    pub fn estimated_cost(&self) -> u32 {
        match self {
            GpuCommand::Draw { estimated_cost, .. } | GpuCommand::Dispatch { estimated_cost, .. } => {
                *estimated_cost
            }
            GpuCommand::Marker(_) => 0,
        }
    }
}

#[derive(Debug)]
pub struct CommandRecorder {
    id: CommandBufferId,
    device: DeviceIndex,
    commands: Vec<GpuCommand>,
}

impl CommandRecorder {
    pub(crate) fn new(id: CommandBufferId, device: DeviceIndex) -> Self {
        Self {
            id,
            device,
            commands: Vec::new(),
        }
    }

    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn draw(&mut self, region: FrameRegion, estimated_cost: u32) -> &mut Self {
        self.push(GpuCommand::Draw {
            region,
            estimated_cost,
        })
    }

    pub fn dispatch(&mut self, groups: [u32; 3], estimated_cost: u32) -> &mut Self {
        self.push(GpuCommand::Dispatch {
            groups,
            estimated_cost,
        })
    }

    pub fn marker(&mut self, label: impl Into<String>) -> &mut Self {
        self.push(GpuCommand::Marker(label.into()))
    }

    pub fn push(&mut self, command: GpuCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub(crate) fn finish(self) -> CommandBuffer {
        CommandBuffer {
            id: self.id,
            device: self.device,
            commands: self.commands.into(),
        }
    }
}

/// A finished, immutable recording. Cloning is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    id: CommandBufferId,
    device: DeviceIndex,
    commands: Arc<[GpuCommand]>,
}

impl CommandBuffer {
    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn estimated_cost(&self) -> u64 {
        self.commands
            .iter()
            .map(|c| u64::from(c.estimated_cost()))
            .sum()
    }
}
