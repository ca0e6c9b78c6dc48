use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::trace;

use super::{
    DeviceDirectory, DeviceError, DeviceIndex, DeviceInfo, MemoryDescriptor, MemoryHandle,
    MemoryLocation, MemorySpan,
};
use crate::sync::lock;
use crate::{CommandBuffer, CommandBufferId, GpuCommand};

#[derive(Debug, Clone)]
pub struct SoftDirectoryOptions {
    pub device_count: u32,
    /// Whether every device exposes a dedicated compute queue.
    pub async_compute: bool,
    /// Per-device execution time multiplier (missing entries default to 1.0).
    pub speed_factors: Vec<f64>,
    /// Simulated execution time per unit of estimated command cost. Zero executes instantly.
    pub cost_unit: Duration,
    /// All device pairs may copy device-to-device.
    pub peer_access: bool,
    /// Per-device memory budget in bytes.
    pub memory_capacity: u64,
}

impl Default for SoftDirectoryOptions {
    fn default() -> Self {
        Self {
            device_count: 3,
            async_compute: true,
            speed_factors: Vec::new(),
            cost_unit: Duration::ZERO,
            peer_access: true,
            memory_capacity: 256 * 1024 * 1024,
        }
    }
}

impl SoftDirectoryOptions {
    pub fn with_devices(device_count: u32) -> Self {
        Self {
            device_count,
            ..Default::default()
        }
    }
}

/// One executed command buffer, stamped with a directory-wide logical clock.
///
/// `started`/`finished` come from a single counter shared by all devices, so
/// `a.finished < b.started` means `a` completed before `b` began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub device: DeviceIndex,
    pub command_buffer: CommandBufferId,
    pub commands: usize,
    pub labels: Vec<String>,
    pub started: u64,
    pub finished: u64,
}

#[derive(Debug, Default)]
struct SoftMemory {
    allocations: HashMap<MemoryHandle, Vec<u8>>,
    used: u64,
}

#[derive(Debug)]
struct SoftDevice {
    info: DeviceInfo,
    speed_factor: f64,
    memory: Mutex<SoftMemory>,
    fail_execution: AtomicBool,
}

/// Deterministic software [`DeviceDirectory`].
#[derive(Debug)]
pub struct SoftDeviceDirectory {
    devices: Vec<SoftDevice>,
    host: Mutex<HashMap<MemoryHandle, Vec<u8>>>,
    cost_unit: Duration,
    peer_access: bool,
    capacity: u64,
    next_handle: AtomicU64,
    clock: AtomicU64,
    fail_allocations: AtomicBool,
    peer_copies: AtomicU64,
    log: Mutex<Vec<ExecutionRecord>>,
}

impl SoftDeviceDirectory {
    pub fn new(options: SoftDirectoryOptions) -> Self {
        let devices = (0..options.device_count)
            .map(|i| {
                let speed_factor = options
                    .speed_factors
                    .get(i as usize)
                    .copied()
                    .filter(|f| f.is_finite() && *f > 0.0)
                    .unwrap_or(1.0);
                SoftDevice {
                    info: DeviceInfo {
                        index: DeviceIndex(i),
                        name: format!("soft-gpu{i}"),
                        async_compute: options.async_compute,
                    },
                    speed_factor,
                    memory: Mutex::new(SoftMemory::default()),
                    fail_execution: AtomicBool::new(false),
                }
            })
            .collect();

        Self {
            devices,
            host: Mutex::new(HashMap::new()),
            cost_unit: options.cost_unit,
            peer_access: options.peer_access,
            capacity: options.memory_capacity,
            next_handle: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            fail_allocations: AtomicBool::new(false),
            peer_copies: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_devices(device_count: u32) -> Self {
        Self::new(SoftDirectoryOptions::with_devices(device_count))
    }

    /// Make every subsequent raw allocation fail with [`DeviceError::OutOfMemory`].
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    /// Make command execution on `device` fail until cleared.
    pub fn set_fail_execution(&self, device: DeviceIndex, fail: bool) {
        if let Some(dev) = self.devices.get(device.as_usize()) {
            dev.fail_execution.store(fail, Ordering::SeqCst);
        }
    }

    pub fn execution_log(&self) -> Vec<ExecutionRecord> {
        lock(&self.log).clone()
    }

    /// Number of live raw allocations across all devices and host memory.
    pub fn live_allocations(&self) -> usize {
        let device_allocs: usize = self
            .devices
            .iter()
            .map(|d| lock(&d.memory).allocations.len())
            .sum();
        device_allocs + lock(&self.host).len()
    }

    pub fn peer_copies(&self) -> u64 {
        self.peer_copies.load(Ordering::Relaxed)
    }

    fn device(&self, index: DeviceIndex) -> Result<&SoftDevice, DeviceError> {
        self.devices
            .get(index.as_usize())
            .ok_or(DeviceError::InvalidDevice(index))
    }

    /// Runs `f` on the backing bytes of `memory` as seen from `device`.
    ///
    /// Host-pinned allocations are reachable from every device.
    fn with_bytes<R>(
        &self,
        device: DeviceIndex,
        memory: MemoryHandle,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<R, DeviceError> {
        let dev = self.device(device)?;
        {
            let mut mem = lock(&dev.memory);
            if let Some(bytes) = mem.allocations.get_mut(&memory) {
                return Ok(f(bytes));
            }
        }
        let mut host = lock(&self.host);
        host.get_mut(&memory)
            .map(f)
            .ok_or(DeviceError::UnknownMemory { device, memory })
    }

    fn simulated_duration(&self, cost: u64, speed_factor: f64) -> Duration {
        if self.cost_unit.is_zero() || cost == 0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(self.cost_unit.as_secs_f64() * cost as f64 * speed_factor)
            .unwrap_or(Duration::ZERO)
    }
}

fn byte_range(offset: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>, DeviceError> {
    let out_of_bounds = || DeviceError::OutOfBounds {
        offset,
        len: len as u64,
        size: size as u64,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > size {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}

impl DeviceDirectory for SoftDeviceDirectory {
    fn active_device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn device_by_index(&self, index: DeviceIndex) -> Option<DeviceInfo> {
        self.devices.get(index.as_usize()).map(|d| d.info.clone())
    }

    fn supports_async_compute_on_device(&self, index: DeviceIndex) -> bool {
        self.devices
            .get(index.as_usize())
            .is_some_and(|d| d.info.async_compute)
    }

    fn supports_peer_access(&self, src: DeviceIndex, dst: DeviceIndex) -> bool {
        self.peer_access && self.contains(src) && self.contains(dst)
    }

    fn allocate_raw_memory(
        &self,
        device: DeviceIndex,
        descriptor: &MemoryDescriptor,
    ) -> Result<MemoryHandle, DeviceError> {
        let dev = self.device(device)?;
        let size = descriptor.size;
        if self.fail_allocations.load(Ordering::SeqCst) {
            return Err(DeviceError::OutOfMemory { device, size });
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory { device, size })?;

        let handle = MemoryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        match descriptor.location {
            MemoryLocation::DeviceLocal => {
                let mut mem = lock(&dev.memory);
                if mem.used.saturating_add(size) > self.capacity {
                    return Err(DeviceError::OutOfMemory { device, size });
                }
                mem.used += size;
                mem.allocations.insert(handle, vec![0; len]);
            }
            MemoryLocation::HostPinned => {
                lock(&self.host).insert(handle, vec![0; len]);
            }
        }
        trace!(%device, ?handle, size, location = ?descriptor.location, "allocated raw memory");
        Ok(handle)
    }

    fn free_raw_memory(
        &self,
        device: DeviceIndex,
        memory: MemoryHandle,
    ) -> Result<(), DeviceError> {
        let dev = self.device(device)?;
        {
            let mut mem = lock(&dev.memory);
            if let Some(bytes) = mem.allocations.remove(&memory) {
                mem.used = mem.used.saturating_sub(bytes.len() as u64);
                return Ok(());
            }
        }
        lock(&self.host)
            .remove(&memory)
            .map(|_| ())
            .ok_or(DeviceError::UnknownMemory { device, memory })
    }

    fn read_raw_memory(&self, span: MemorySpan, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.with_bytes(span.device, span.memory, |bytes| {
            let range = byte_range(span.offset, dst.len(), bytes.len())?;
            dst.copy_from_slice(&bytes[range]);
            Ok(())
        })?
    }

    fn write_raw_memory(&self, span: MemorySpan, src: &[u8]) -> Result<(), DeviceError> {
        self.with_bytes(span.device, span.memory, |bytes| {
            let range = byte_range(span.offset, src.len(), bytes.len())?;
            bytes[range].copy_from_slice(src);
            Ok(())
        })?
    }

    fn copy_raw_memory_peer(
        &self,
        src: MemorySpan,
        dst: MemorySpan,
        len: u64,
    ) -> Result<(), DeviceError> {
        if !self.supports_peer_access(src.device, dst.device) {
            return Err(DeviceError::PeerAccessUnsupported {
                src: src.device,
                dst: dst.device,
            });
        }
        let len = usize::try_from(len).map_err(|_| DeviceError::OutOfBounds {
            offset: src.offset,
            len,
            size: 0,
        })?;
        // Both ends may live behind the same lock, so go through an intermediate copy.
        let mut staging = vec![0u8; len];
        self.read_raw_memory(src, &mut staging)?;
        self.write_raw_memory(dst, &staging)?;
        self.peer_copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn execute_command_buffer(
        &self,
        device: DeviceIndex,
        command_buffer: &CommandBuffer,
    ) -> Result<(), DeviceError> {
        let dev = self.device(device)?;
        if dev.fail_execution.load(Ordering::SeqCst) {
            return Err(DeviceError::ExecutionFailed {
                device,
                reason: "injected execution fault".into(),
            });
        }

        let started = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut labels = Vec::new();
        let mut cost = 0u64;
        for cmd in command_buffer.commands() {
            match cmd {
                GpuCommand::Marker(label) => labels.push(label.clone()),
                other => cost += u64::from(other.estimated_cost()),
            }
        }
        let busy = self.simulated_duration(cost, dev.speed_factor);
        if !busy.is_zero() {
            std::thread::sleep(busy);
        }
        let finished = self.clock.fetch_add(1, Ordering::SeqCst);

        trace!(%device, command_buffer = command_buffer.id().0, cost, ?busy, "executed command buffer");
        lock(&self.log).push(ExecutionRecord {
            device,
            command_buffer: command_buffer.id(),
            commands: command_buffer.commands().len(),
            labels,
            started,
            finished,
        });
        Ok(())
    }
}
