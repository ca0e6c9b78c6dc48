//! Device Directory: the boundary between the multi-GPU core and the native graphics API.
//!
//! Device discovery, queue creation and raw allocation live behind [`DeviceDirectory`]. The core
//! treats the directory as read-only for the duration of a frame; implementations build their
//! device list once at construction and never mutate it on the submission path.
//!
//! [`SoftDeviceDirectory`] is a deterministic in-process implementation. Device memory is plain
//! host memory and command execution only records what ran (optionally sleeping to simulate
//! cost), which is enough to exercise partitioning, ordering and placement end to end.

mod soft;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::CommandBuffer;

pub use soft::{ExecutionRecord, SoftDeviceDirectory, SoftDirectoryOptions};

/// Dense device index in `[0, active_device_count)`.
///
/// Indices are not stable across re-initialization of the directory.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceIndex(pub u32);

impl DeviceIndex {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for DeviceIndex {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

/// Descriptive information about one active device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: DeviceIndex,
    pub name: String,
    pub async_compute: bool,
}

/// Opaque raw allocation handle returned by [`DeviceDirectory::allocate_raw_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Device-resident memory, only reachable from the owning device.
    DeviceLocal,
    /// Host-resident memory that every device can access without a copy.
    HostPinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub size: u64,
    pub location: MemoryLocation,
}

/// A byte offset into a raw allocation as seen from `device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpan {
    pub device: DeviceIndex,
    pub memory: MemoryHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device {0} is not active")]
    InvalidDevice(DeviceIndex),

    #[error("out of memory on {device} (requested {size} bytes)")]
    OutOfMemory { device: DeviceIndex, size: u64 },

    #[error("unknown memory handle {memory:?} on {device}")]
    UnknownMemory {
        device: DeviceIndex,
        memory: MemoryHandle,
    },

    #[error("memory access out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("peer access unsupported between {src} and {dst}")]
    PeerAccessUnsupported { src: DeviceIndex, dst: DeviceIndex },

    #[error("execution failed on {device}: {reason}")]
    ExecutionFailed { device: DeviceIndex, reason: String },
}

/// Authoritative list of active devices plus the raw operations the core needs from them.
///
/// Implementations must be shareable across the per-device worker threads.
pub trait DeviceDirectory: Send + Sync {
    fn active_device_count(&self) -> u32;

    fn device_by_index(&self, index: DeviceIndex) -> Option<DeviceInfo>;

    fn supports_async_compute_on_device(&self, index: DeviceIndex) -> bool;

    /// True iff at least two devices are active.
    fn supports_memory_sharing(&self) -> bool {
        self.active_device_count() >= 2
    }

    /// Whether `src` can copy directly into `dst` memory without staging through the host.
    fn supports_peer_access(&self, src: DeviceIndex, dst: DeviceIndex) -> bool;

    fn allocate_raw_memory(
        &self,
        device: DeviceIndex,
        descriptor: &MemoryDescriptor,
    ) -> Result<MemoryHandle, DeviceError>;

    fn free_raw_memory(&self, device: DeviceIndex, memory: MemoryHandle)
        -> Result<(), DeviceError>;

    fn read_raw_memory(&self, span: MemorySpan, dst: &mut [u8]) -> Result<(), DeviceError>;

    fn write_raw_memory(&self, span: MemorySpan, src: &[u8]) -> Result<(), DeviceError>;

    /// Device-to-device copy over the interconnect.
    ///
    /// Returns [`DeviceError::PeerAccessUnsupported`] when no direct path exists; callers fall
    /// back to staging through host memory.
    fn copy_raw_memory_peer(
        &self,
        src: MemorySpan,
        dst: MemorySpan,
        len: u64,
    ) -> Result<(), DeviceError>;

    /// Execute one recorded command buffer on `device`, blocking until it finishes.
    fn execute_command_buffer(
        &self,
        device: DeviceIndex,
        command_buffer: &CommandBuffer,
    ) -> Result<(), DeviceError>;

    fn contains(&self, index: DeviceIndex) -> bool {
        index.0 < self.active_device_count()
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        (0..self.active_device_count())
            .filter_map(|i| self.device_by_index(DeviceIndex(i)))
            .collect()
    }
}
