//! Memory Placement Manager.
//!
//! Tracks, for every buffer and image, which placement strategy it was created with and which
//! raw allocations back it on which devices. The registry is the only place placement is
//! decided:
//! - `Replicated`: one full-size copy per target device (all devices when no targets are given).
//!   The first device holds the source of truth; copies only converge on
//!   [`MemoryPlacementManager::replicate_buffer_to_all_gpus`].
//! - `Distributed`: one slice per device following the Frame Distributor's current regions.
//! - `PinnedHost`: one host-resident allocation visible to every device without a copy.
//! - `DeviceLocal`: one allocation on the first target device, or device 0.
//!
//! Allocate and free are serialized. Map and copy only hold the registry lock long enough to
//! clone the entry, so they never block on unrelated handles.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::sync::lock;
use crate::{
    DeviceDirectory, DeviceError, DeviceIndex, FrameDistributor, FrameRegion, MemoryDescriptor,
    MemoryHandle, MemoryLocation, MemorySpan, MultiGpuStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageHandle(pub u64);

/// Either kind of registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Buffer(BufferHandle),
    Image(ImageHandle),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Buffer(h) => write!(f, "buffer#{}", h.0),
            ResourceId::Image(h) => write!(f, "image#{}", h.0),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
        const MAP_READ = 1 << 6;
        const MAP_WRITE = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    R8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgba8Unorm | ImageFormat::Bgra8Unorm | ImageFormat::Depth32Float => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl ImageDescriptor {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * self.format.bytes_per_pixel()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementStrategy {
    Replicated,
    Distributed,
    PinnedHost,
    DeviceLocal,
}

/// Path a cross-device copy actually took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyRoute {
    SameDevice,
    PeerToPeer,
    HostStaged,
}

/// Registry view of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub strategy: PlacementStrategy,
    /// Devices that can access the resource, source of truth first for `Replicated`.
    pub devices: Vec<DeviceIndex>,
    pub size: u64,
    /// Image sub-rectangle per device for `Distributed` images.
    pub image_regions: Vec<FrameRegion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("{0} is not registered")]
    Unregistered(ResourceId),

    #[error("{0} is already registered")]
    AlreadyRegistered(ResourceId),

    #[error("{resource} uses {actual:?} placement, expected {expected:?}")]
    WrongStrategy {
        resource: ResourceId,
        expected: PlacementStrategy,
        actual: PlacementStrategy,
    },

    #[error("{resource} has no backing storage on {device}")]
    NotResident {
        resource: ResourceId,
        device: DeviceIndex,
    },

    #[error("{0} is already mapped")]
    AlreadyMapped(ResourceId),

    #[error("access of {len} bytes exceeds {available} available bytes")]
    OutOfBounds { len: u64, available: u64 },

    #[error("resources must have a non-zero size")]
    ZeroSize,

    #[error("device {0} is not active")]
    InvalidDevice(DeviceIndex),

    #[error("distributed placement needs a non-empty frame partition")]
    NoPartition,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    device: DeviceIndex,
    memory: MemoryHandle,
    /// Offset of this slice within the logical resource.
    logical_offset: u64,
    size: u64,
}

#[derive(Debug)]
struct ResourceEntry {
    id: ResourceId,
    strategy: PlacementStrategy,
    size: u64,
    devices: Vec<DeviceIndex>,
    allocations: Vec<Allocation>,
    image_regions: Vec<FrameRegion>,
    mapped: AtomicBool,
}

impl ResourceEntry {
    /// Allocation reachable from `device`, with the span to address it from that device.
    fn resident(&self, device: DeviceIndex) -> Result<(Allocation, MemorySpan), ResourceError> {
        let not_resident = || ResourceError::NotResident {
            resource: self.id,
            device,
        };
        let alloc = match self.strategy {
            PlacementStrategy::PinnedHost if self.devices.contains(&device) => {
                self.allocations.first().copied()
            }
            PlacementStrategy::PinnedHost => None,
            _ => self.allocations.iter().find(|a| a.device == device).copied(),
        }
        .ok_or_else(not_resident)?;

        Ok((
            alloc,
            MemorySpan {
                device,
                memory: alloc.memory,
                offset: 0,
            },
        ))
    }

    fn placement(&self) -> Placement {
        Placement {
            strategy: self.strategy,
            devices: self.devices.clone(),
            size: self.size,
            image_regions: self.image_regions.clone(),
        }
    }
}

/// One planned raw allocation.
struct Slice {
    device: DeviceIndex,
    location: MemoryLocation,
    logical_offset: u64,
    size: u64,
}

pub struct MemoryPlacementManager {
    directory: Arc<dyn DeviceDirectory>,
    frames: Arc<FrameDistributor>,
    stats: Arc<MultiGpuStats>,
    registry: RwLock<HashMap<ResourceId, Arc<ResourceEntry>>>,
    alloc_lock: Mutex<()>,
    next_handle: AtomicU64,
}

impl fmt::Debug for MemoryPlacementManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPlacementManager")
            .field("live_resources", &self.live_resources())
            .finish_non_exhaustive()
    }
}

impl MemoryPlacementManager {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        frames: Arc<FrameDistributor>,
        stats: Arc<MultiGpuStats>,
    ) -> Self {
        Self {
            directory,
            frames,
            stats,
            registry: RwLock::new(HashMap::new()),
            alloc_lock: Mutex::new(()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn entry(&self, id: ResourceId) -> Result<Arc<ResourceEntry>, ResourceError> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(ResourceError::Unregistered(id))
    }

    fn is_registered(&self, id: ResourceId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Fresh handle value not currently registered as either kind. Caller holds `alloc_lock`.
    fn fresh_handle(&self) -> u64 {
        loop {
            let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if !self.is_registered(ResourceId::Buffer(BufferHandle(raw)))
                && !self.is_registered(ResourceId::Image(ImageHandle(raw)))
            {
                return raw;
            }
        }
    }

    /// Target devices, validated and de-duplicated in order.
    fn resolve_targets(&self, targets: &[DeviceIndex]) -> Result<Vec<DeviceIndex>, ResourceError> {
        let mut out = Vec::with_capacity(targets.len());
        for &device in targets {
            if !self.directory.contains(device) {
                return Err(ResourceError::InvalidDevice(device));
            }
            if !out.contains(&device) {
                out.push(device);
            }
        }
        Ok(out)
    }

    fn first_target_or_default(&self, targets: &[DeviceIndex]) -> Result<DeviceIndex, ResourceError> {
        let device = targets.first().copied().unwrap_or_default();
        if !self.directory.contains(device) {
            return Err(ResourceError::InvalidDevice(device));
        }
        Ok(device)
    }

    /// Plan slices and accessible devices for a resource of `size` bytes.
    ///
    /// `image` switches `Distributed` from area-proportional byte slices to per-region image
    /// sub-rectangles.
    fn plan(
        &self,
        strategy: PlacementStrategy,
        size: u64,
        targets: &[DeviceIndex],
        image: Option<&ImageDescriptor>,
    ) -> Result<(Vec<Slice>, Vec<DeviceIndex>, Vec<FrameRegion>), ResourceError> {
        let targets = self.resolve_targets(targets)?;
        let whole = |device| Slice {
            device,
            location: MemoryLocation::DeviceLocal,
            logical_offset: 0,
            size,
        };

        match strategy {
            PlacementStrategy::Replicated => {
                let devices = if targets.is_empty() {
                    self.directory.devices().into_iter().map(|d| d.index).collect()
                } else {
                    targets
                };
                if devices.is_empty() {
                    return Err(ResourceError::InvalidDevice(DeviceIndex(0)));
                }
                Ok((devices.iter().map(|d| whole(*d)).collect(), devices, Vec::new()))
            }
            PlacementStrategy::DeviceLocal => {
                let device = self.first_target_or_default(&targets)?;
                Ok((vec![whole(device)], vec![device], Vec::new()))
            }
            PlacementStrategy::PinnedHost => {
                let owner = self.first_target_or_default(&targets)?;
                let devices = self.directory.devices().into_iter().map(|d| d.index).collect();
                let slice = Slice {
                    location: MemoryLocation::HostPinned,
                    ..whole(owner)
                };
                Ok((vec![slice], devices, Vec::new()))
            }
            PlacementStrategy::Distributed => {
                let regions = self.frames.compute_frame_regions();
                let frame_area: u64 = regions.iter().map(FrameRegion::area).sum();
                if frame_area == 0 {
                    return Err(ResourceError::NoPartition);
                }
                match image {
                    Some(desc) => Ok(self.plan_distributed_image(desc, &regions)),
                    None => Ok(plan_distributed_buffer(size, &regions, frame_area)),
                }
            }
        }
    }

    fn plan_distributed_image(
        &self,
        desc: &ImageDescriptor,
        regions: &[FrameRegion],
    ) -> (Vec<Slice>, Vec<DeviceIndex>, Vec<FrameRegion>) {
        let (frame_w, frame_h) = self.frames.frame_resolution();
        let scale = |v: u32, image: u32, frame: u32| -> u32 {
            if frame == 0 {
                0
            } else {
                (u64::from(v) * u64::from(image) / u64::from(frame)) as u32
            }
        };

        let mut slices = Vec::new();
        let mut devices = Vec::new();
        let mut sub_rects = Vec::new();
        let mut logical_offset = 0;
        for region in regions.iter().filter(|r| !r.is_empty()) {
            let x0 = scale(region.offset_x, desc.width, frame_w);
            let x1 = scale(region.right(), desc.width, frame_w);
            let y0 = scale(region.offset_y, desc.height, frame_h);
            let y1 = scale(region.bottom(), desc.height, frame_h);
            let rect = FrameRegion::new(x0, y0, x1 - x0, y1 - y0, region.device);
            if rect.is_empty() {
                continue;
            }
            let size = rect.area() * desc.format.bytes_per_pixel();
            slices.push(Slice {
                device: region.device,
                location: MemoryLocation::DeviceLocal,
                logical_offset,
                size,
            });
            logical_offset += size;
            devices.push(region.device);
            sub_rects.push(rect);
        }
        (slices, devices, sub_rects)
    }

    /// Allocate every planned slice, rolling back on the first failure.
    fn allocate_slices(&self, slices: &[Slice]) -> Result<Vec<Allocation>, ResourceError> {
        let mut done: Vec<Allocation> = Vec::with_capacity(slices.len());
        for slice in slices {
            let descriptor = MemoryDescriptor {
                size: slice.size,
                location: slice.location,
            };
            match self.directory.allocate_raw_memory(slice.device, &descriptor) {
                Ok(memory) => done.push(Allocation {
                    device: slice.device,
                    memory,
                    logical_offset: slice.logical_offset,
                    size: slice.size,
                }),
                Err(e) => {
                    warn!(device = %slice.device, size = slice.size, %e, "allocation failed; rolling back");
                    self.release(&done);
                    return Err(e.into());
                }
            }
        }
        Ok(done)
    }

    fn release(&self, allocations: &[Allocation]) {
        for alloc in allocations {
            if let Err(e) = self.directory.free_raw_memory(alloc.device, alloc.memory) {
                warn!(device = %alloc.device, memory = ?alloc.memory, %e, "failed to free raw memory");
            }
        }
    }

    fn register(
        &self,
        id: ResourceId,
        strategy: PlacementStrategy,
        size: u64,
        targets: &[DeviceIndex],
        image: Option<&ImageDescriptor>,
    ) -> Result<(), ResourceError> {
        if size == 0 {
            return Err(ResourceError::ZeroSize);
        }
        if self.is_registered(id) {
            return Err(ResourceError::AlreadyRegistered(id));
        }
        let (slices, devices, image_regions) = self.plan(strategy, size, targets, image)?;
        let allocations = self.allocate_slices(&slices)?;

        let entry = Arc::new(ResourceEntry {
            id,
            strategy,
            size,
            devices,
            allocations,
            image_regions,
            mapped: AtomicBool::new(false),
        });
        debug!(resource = %id, ?strategy, size, devices = ?entry.devices, "registered resource");
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
        self.stats.resource_registered();
        Ok(())
    }

    fn unregister(&self, id: ResourceId) -> bool {
        let _guard = lock(&self.alloc_lock);
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(entry) => {
                self.release(&entry.allocations);
                self.stats.resource_released();
                debug!(resource = %id, "freed resource");
                true
            }
            None => {
                debug!(resource = %id, "free of unregistered resource ignored");
                false
            }
        }
    }

    pub fn allocate_buffer(
        &self,
        usage: BufferUsage,
        size: u64,
        strategy: PlacementStrategy,
        target_devices: &[DeviceIndex],
    ) -> Result<BufferHandle, ResourceError> {
        let _guard = lock(&self.alloc_lock);
        let handle = BufferHandle(self.fresh_handle());
        self.register(ResourceId::Buffer(handle), strategy, size, target_devices, None)?;
        debug!(buffer = handle.0, ?usage, "allocated buffer");
        Ok(handle)
    }

    /// Register a buffer under a caller-chosen handle.
    pub fn allocate_buffer_as(
        &self,
        handle: BufferHandle,
        usage: BufferUsage,
        size: u64,
        strategy: PlacementStrategy,
        target_devices: &[DeviceIndex],
    ) -> Result<(), ResourceError> {
        let _guard = lock(&self.alloc_lock);
        self.register(ResourceId::Buffer(handle), strategy, size, target_devices, None)?;
        debug!(buffer = handle.0, ?usage, "allocated buffer");
        Ok(())
    }

    pub fn allocate_image(
        &self,
        descriptor: ImageDescriptor,
        strategy: PlacementStrategy,
        target_devices: &[DeviceIndex],
    ) -> Result<ImageHandle, ResourceError> {
        let _guard = lock(&self.alloc_lock);
        let handle = ImageHandle(self.fresh_handle());
        self.register(
            ResourceId::Image(handle),
            strategy,
            descriptor.size_bytes(),
            target_devices,
            Some(&descriptor),
        )?;
        Ok(handle)
    }

    /// Returns `false` if `buffer` was not registered. Never fails.
    pub fn free_buffer(&self, buffer: BufferHandle) -> bool {
        self.unregister(ResourceId::Buffer(buffer))
    }

    /// Returns `false` if `image` was not registered. Never fails.
    pub fn free_image(&self, image: ImageHandle) -> bool {
        self.unregister(ResourceId::Image(image))
    }

    pub fn placement(&self, buffer: BufferHandle) -> Option<Placement> {
        self.entry(ResourceId::Buffer(buffer)).ok().map(|e| e.placement())
    }

    pub fn image_placement(&self, image: ImageHandle) -> Option<Placement> {
        self.entry(ResourceId::Image(image)).ok().map(|e| e.placement())
    }

    pub fn live_resources(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Copy `size` bytes from `src` as stored on `src_device` to `dst` as stored on `dst_device`.
    ///
    /// Uses a direct device-to-device path when both devices support it and falls back to
    /// staging through host memory otherwise, including when the direct copy fails.
    pub fn copy_buffer_between_gpus(
        &self,
        src_device: DeviceIndex,
        dst_device: DeviceIndex,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> Result<CopyRoute, ResourceError> {
        let src_entry = self.entry(ResourceId::Buffer(src))?;
        let dst_entry = self.entry(ResourceId::Buffer(dst))?;
        let (src_alloc, src_span) = src_entry.resident(src_device)?;
        let (dst_alloc, dst_span) = dst_entry.resident(dst_device)?;
        let available = src_alloc.size.min(dst_alloc.size);
        if size > available {
            return Err(ResourceError::OutOfBounds {
                len: size,
                available,
            });
        }
        self.copy_span(src_span, dst_span, size)
    }

    fn copy_span(
        &self,
        src: MemorySpan,
        dst: MemorySpan,
        len: u64,
    ) -> Result<CopyRoute, ResourceError> {
        let cross_device = src.device != dst.device;
        if cross_device
            && self.directory.supports_memory_sharing()
            && self.directory.supports_peer_access(src.device, dst.device)
        {
            match self.directory.copy_raw_memory_peer(src, dst, len) {
                Ok(()) => {
                    self.stats.inc_peer_copies();
                    return Ok(CopyRoute::PeerToPeer);
                }
                Err(e) => {
                    warn!(src = %src.device, dst = %dst.device, %e, "peer copy failed; staging through host");
                }
            }
        }

        let staged_len = usize::try_from(len).map_err(|_| ResourceError::OutOfBounds {
            len,
            available: usize::MAX as u64,
        })?;
        let mut staging = vec![0u8; staged_len];
        self.directory.read_raw_memory(src, &mut staging)?;
        self.directory.write_raw_memory(dst, &staging)?;
        if cross_device {
            self.stats.inc_host_staged_copies();
            Ok(CopyRoute::HostStaged)
        } else {
            Ok(CopyRoute::SameDevice)
        }
    }

    /// Copy a `Replicated` buffer's source-of-truth contents to every other copy. Returns the
    /// number of copies refreshed.
    pub fn replicate_buffer_to_all_gpus(&self, buffer: BufferHandle) -> Result<usize, ResourceError> {
        let id = ResourceId::Buffer(buffer);
        let entry = self.entry(id)?;
        if entry.strategy != PlacementStrategy::Replicated {
            return Err(ResourceError::WrongStrategy {
                resource: id,
                expected: PlacementStrategy::Replicated,
                actual: entry.strategy,
            });
        }
        let Some((&source, replicas)) = entry.allocations.split_first() else {
            return Ok(0);
        };
        let src_span = MemorySpan {
            device: source.device,
            memory: source.memory,
            offset: 0,
        };
        for replica in replicas {
            let dst_span = MemorySpan {
                device: replica.device,
                memory: replica.memory,
                offset: 0,
            };
            let route = self.copy_span(src_span, dst_span, entry.size)?;
            debug!(buffer = buffer.0, src = %source.device, dst = %replica.device, ?route, "replicated buffer");
        }
        self.stats.inc_replications();
        Ok(replicas.len())
    }

    /// Map the copy of `buffer` that `device` owns. Distributed buffers map only that device's
    /// slice; no merged view is ever produced.
    pub fn map_memory(&self, buffer: BufferHandle, device: DeviceIndex) -> Result<MappedMemory, ResourceError> {
        let id = ResourceId::Buffer(buffer);
        let entry = self.entry(id)?;
        let (alloc, span) = entry.resident(device)?;
        if entry
            .mapped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ResourceError::AlreadyMapped(id));
        }

        let mut data = vec![0u8; alloc.size as usize];
        if let Err(e) = self.directory.read_raw_memory(span, &mut data) {
            entry.mapped.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(MappedMemory {
            directory: self.directory.clone(),
            entry,
            span,
            logical_offset: alloc.logical_offset,
            data,
            released: false,
        })
    }

    /// Write the mapping back and release it, reporting any write-back failure.
    pub fn unmap_memory(&self, mut mapping: MappedMemory) -> Result<(), ResourceError> {
        mapping.release()
    }
}

fn plan_distributed_buffer(
    size: u64,
    regions: &[FrameRegion],
    frame_area: u64,
) -> (Vec<Slice>, Vec<DeviceIndex>, Vec<FrameRegion>) {
    let last = regions.len().saturating_sub(1);
    let mut slices = Vec::new();
    let mut devices = Vec::new();
    let mut logical_offset = 0u64;
    for (i, region) in regions.iter().enumerate() {
        let share = if i == last {
            size - logical_offset
        } else {
            (u128::from(size) * u128::from(region.area()) / u128::from(frame_area)) as u64
        };
        if share == 0 {
            continue;
        }
        slices.push(Slice {
            device: region.device,
            location: MemoryLocation::DeviceLocal,
            logical_offset,
            size: share,
        });
        logical_offset += share;
        devices.push(region.device);
    }
    (slices, devices, Vec::new())
}

/// Host view of one device's copy of a buffer. Writes reach the device on unmap or drop.
pub struct MappedMemory {
    directory: Arc<dyn DeviceDirectory>,
    entry: Arc<ResourceEntry>,
    span: MemorySpan,
    logical_offset: u64,
    data: Vec<u8>,
    released: bool,
}

impl fmt::Debug for MappedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedMemory")
            .field("resource", &self.entry.id)
            .field("device", &self.span.device)
            .field("logical_offset", &self.logical_offset)
            .field("len", &self.data.len())
            .finish()
    }
}

impl MappedMemory {
    pub fn device(&self) -> DeviceIndex {
        self.span.device
    }

    /// Offset of the mapped bytes within the whole logical buffer.
    pub fn logical_offset(&self) -> u64 {
        self.logical_offset
    }

    fn release(&mut self) -> Result<(), ResourceError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let result = self.directory.write_raw_memory(self.span, &self.data);
        self.entry.mapped.store(false, Ordering::Release);
        result.map_err(ResourceError::from)
    }
}

impl Deref for MappedMemory {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for MappedMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(resource = %self.entry.id, device = %self.span.device, %e, "write-back on drop failed");
        }
    }
}
