//! `aero-multigpu` splits one rendered frame across several independent GPUs.
//!
//! The crate is built from four cooperating components that all share one
//! [`DeviceDirectory`]:
//! - [`FrameDistributor`]: partitions the frame into one [`FrameRegion`] per device and drives
//!   the per-frame submit/complete cycle.
//! - [`MultiGpuSynchronizer`]: per-device frame counters, timelines, one-shot events and
//!   inter-device barriers.
//! - [`CommandDistributor`]: per-device submission queues executed in parallel, completion
//!   tracking and workload-balancing feedback.
//! - [`MemoryPlacementManager`]: which device(s) back each buffer/image, plus cross-device copy
//!   and replication.
//!
//! [`MultiGpuContext`] wires the four together. [`SoftDeviceDirectory`] is a deterministic
//! software directory used by tests and the simulator.

#![forbid(unsafe_code)]

mod balance;
mod command;
mod config;
mod context;
mod error;
mod memory;
mod recovery;
mod stats;
mod submit;

pub mod directory;
pub mod frame;
pub mod sync;

pub use balance::{PartitionHint, WorkloadBalancer};
pub use command::{CommandBuffer, CommandBufferId, CommandRecorder, GpuCommand};
pub use config::{parse_resolution, ConfigError, MultiGpuConfig};
pub use context::MultiGpuContext;
pub use directory::{
    DeviceDirectory, DeviceError, DeviceIndex, DeviceInfo, ExecutionRecord, MemoryDescriptor,
    MemoryHandle, MemoryLocation, MemorySpan, SoftDeviceDirectory, SoftDirectoryOptions,
};
pub use error::MultiGpuError;
pub use frame::{
    DistributionMode, FrameDistributor, FrameRegion, PartitionKey, RegionDependency, SubmittedFrame,
};
pub use memory::{
    BufferHandle, BufferUsage, CopyRoute, ImageDescriptor, ImageFormat, ImageHandle,
    MappedMemory, MemoryPlacementManager, Placement, PlacementStrategy, ResourceError, ResourceId,
};
pub use recovery::{DeviceHealth, RecoveryAction, StallTracker};
pub use stats::{MultiGpuStats, MultiGpuStatsSnapshot};
pub use submit::{
    CommandDistributor, CompletionFence, GpuCommandSubmission, SubmissionCompletion, SubmitError,
};
pub use sync::{
    EventHandle, InterGpuBarrier, MultiGpuSynchronizer, PendingPrimitives, PipelineStages,
    SignalPrimitive, SyncError, TimelineHandle, WaitPrimitive,
};
