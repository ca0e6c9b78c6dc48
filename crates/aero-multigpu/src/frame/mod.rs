//! Frame Distributor: splits each frame across the active devices and drives it to completion.
//!
//! The distributor owns the current [`DistributionMode`] and resolution. Region computation is
//! memoised on a [`PartitionKey`]; any change to mode, resolution, device count, the alternate
//! frame slot or the latched balancing weights produces a new key and therefore a fresh
//! partition.

mod partition;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::sync::lock;
use crate::{
    CommandBuffer, CommandDistributor, ConfigError, DeviceDirectory, DeviceIndex,
    GpuCommandSubmission, InterGpuBarrier, MultiGpuError, MultiGpuStats, MultiGpuSynchronizer,
    PartitionHint, PipelineStages, SignalPrimitive, SubmitError, SyncError, WorkloadBalancer,
};

pub use partition::{
    compute_regions, horizontal_split, quadrant_split, vertical_split, weighted_split,
    PartitionKey,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionMode {
    /// Equal-width vertical strips, one per device.
    #[default]
    HorizontalSplit,
    /// Equal-height horizontal strips, one per device.
    VerticalSplit,
    /// Four quadrants for the first four devices.
    QuadrantSplit,
    /// One device renders the whole frame, rotating per frame.
    AlternateFrame,
    /// Strips sized from measured per-device cost.
    OptimizedSplit,
}

impl DistributionMode {
    pub const ALL: [DistributionMode; 5] = [
        DistributionMode::HorizontalSplit,
        DistributionMode::VerticalSplit,
        DistributionMode::QuadrantSplit,
        DistributionMode::AlternateFrame,
        DistributionMode::OptimizedSplit,
    ];

    /// Decode a raw mode value as stored in settings blobs. Unknown values fall back to
    /// [`DistributionMode::HorizontalSplit`].
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => DistributionMode::VerticalSplit,
            2 => DistributionMode::QuadrantSplit,
            3 => DistributionMode::AlternateFrame,
            4 => DistributionMode::OptimizedSplit,
            _ => DistributionMode::HorizontalSplit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistributionMode::HorizontalSplit => "horizontal",
            DistributionMode::VerticalSplit => "vertical",
            DistributionMode::QuadrantSplit => "quadrant",
            DistributionMode::AlternateFrame => "afr",
            DistributionMode::OptimizedSplit => "optimized",
        }
    }
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistributionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "horizontal" | "horizontal-split" => Ok(DistributionMode::HorizontalSplit),
            "vertical" | "vertical-split" => Ok(DistributionMode::VerticalSplit),
            "quadrant" | "quadrant-split" => Ok(DistributionMode::QuadrantSplit),
            "afr" | "alternate-frame" => Ok(DistributionMode::AlternateFrame),
            "optimized" | "optimized-split" => Ok(DistributionMode::OptimizedSplit),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Rectangle of the frame assigned to one device. Regions are values; a computed partition is
/// never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameRegion {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    pub device: DeviceIndex,
}

impl FrameRegion {
    pub const fn new(
        offset_x: u32,
        offset_y: u32,
        width: u32,
        height: u32,
        device: DeviceIndex,
    ) -> Self {
        Self {
            offset_x,
            offset_y,
            width,
            height,
            device,
        }
    }

    pub const fn empty(device: DeviceIndex) -> Self {
        Self::new(0, 0, 0, 0, device)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn right(&self) -> u32 {
        self.offset_x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.offset_y + self.height
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.offset_x && x < self.right() && y >= self.offset_y && y < self.bottom()
    }

    pub fn overlaps(&self, other: &FrameRegion) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.offset_x < other.right()
            && other.offset_x < self.right()
            && self.offset_y < other.bottom()
            && other.offset_y < self.bottom()
    }
}

/// `consumer` reads what `producer` wrote during the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDependency {
    pub producer: DeviceIndex,
    pub consumer: DeviceIndex,
    pub producer_stage: PipelineStages,
    pub consumer_stage: PipelineStages,
}

impl RegionDependency {
    /// Color output on the producer feeding fragment shading on the consumer.
    pub fn new(producer: DeviceIndex, consumer: DeviceIndex) -> Self {
        Self {
            producer,
            consumer,
            producer_stage: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            consumer_stage: PipelineStages::FRAGMENT_SHADER,
        }
    }
}

/// Frame handed to the Command Distributor, with the devices that got a submission for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedFrame {
    pub frame_id: u64,
    pub devices: Vec<DeviceIndex>,
}

#[derive(Debug)]
struct FrameState {
    mode: DistributionMode,
    width: u32,
    height: u32,
    next_frame_id: u64,
    open_frame: Option<u64>,
    hint: Option<PartitionHint>,
    last_submitted: Option<SubmittedFrame>,
}

#[derive(Debug)]
struct CachedPartition {
    key: PartitionKey,
    regions: Arc<[FrameRegion]>,
}

pub struct FrameDistributor {
    directory: Arc<dyn DeviceDirectory>,
    synchronizer: Arc<MultiGpuSynchronizer>,
    commands: Arc<CommandDistributor>,
    balancer: Arc<WorkloadBalancer>,
    stats: Arc<MultiGpuStats>,
    state: Mutex<FrameState>,
    cache: Mutex<Option<CachedPartition>>,
}

impl fmt::Debug for FrameDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDistributor")
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

impl FrameDistributor {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        synchronizer: Arc<MultiGpuSynchronizer>,
        commands: Arc<CommandDistributor>,
        balancer: Arc<WorkloadBalancer>,
        stats: Arc<MultiGpuStats>,
    ) -> Self {
        Self {
            directory,
            synchronizer,
            commands,
            balancer,
            stats,
            state: Mutex::new(FrameState {
                mode: DistributionMode::default(),
                width: 0,
                height: 0,
                next_frame_id: 1,
                open_frame: None,
                hint: None,
                last_submitted: None,
            }),
            cache: Mutex::new(None),
        }
    }

    pub fn set_distribution_mode(&self, mode: DistributionMode) {
        let mut state = lock(&self.state);
        if state.mode != mode {
            info!(from = %state.mode, to = %mode, "distribution mode changed");
            state.mode = mode;
        }
    }

    pub fn distribution_mode(&self) -> DistributionMode {
        lock(&self.state).mode
    }

    pub fn set_frame_resolution(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroResolution { width, height });
        }
        let mut state = lock(&self.state);
        state.width = width;
        state.height = height;
        debug!(width, height, "frame resolution set");
        Ok(())
    }

    pub fn frame_resolution(&self) -> (u32, u32) {
        let state = lock(&self.state);
        (state.width, state.height)
    }

    /// Key describing the partition the next call to [`Self::compute_frame_regions`] returns.
    ///
    /// Between frames the key previews the hint the next [`Self::begin_frame`] will latch, so
    /// regions recorded before the frame is opened match the ones it is distributed with.
    pub fn partition_key(&self) -> PartitionKey {
        let state = lock(&self.state);
        let (frame_id, hint) = match state.open_frame {
            Some(open) => (open, state.hint.clone()),
            None => (
                state.next_frame_id,
                self.balancer.pending_hint().or_else(|| state.hint.clone()),
            ),
        };
        PartitionKey::for_frame(
            state.mode,
            state.width,
            state.height,
            self.directory.active_device_count(),
            frame_id,
            hint.as_ref(),
        )
    }

    /// Regions for the current frame. Repeated calls with unchanged inputs return the same
    /// allocation.
    pub fn compute_frame_regions(&self) -> Arc<[FrameRegion]> {
        let key = self.partition_key();
        let mut cache = lock(&self.cache);
        if let Some(cached) = cache.as_ref() {
            if cached.key == key {
                return cached.regions.clone();
            }
        }

        let regions: Arc<[FrameRegion]> = compute_regions(&key).into();
        debug!(
            mode = %key.mode,
            width = key.width,
            height = key.height,
            devices = key.device_count,
            regions = regions.len(),
            "recomputed frame partition"
        );
        *cache = Some(CachedPartition {
            key,
            regions: regions.clone(),
        });
        regions
    }

    /// Region owned by `device`, or an empty region when the device has no part of this frame.
    pub fn region_for_gpu(&self, device: DeviceIndex) -> FrameRegion {
        self.compute_frame_regions()
            .iter()
            .find(|r| r.device == device)
            .copied()
            .unwrap_or_else(|| FrameRegion::empty(device))
    }

    /// Open the next frame and return its id. Balancing weights published since the previous
    /// frame take effect here and stay fixed until the frame is distributed.
    ///
    /// Calling this again before the frame is distributed returns the already open frame.
    pub fn begin_frame(&self) -> u64 {
        let mut state = lock(&self.state);
        if let Some(open) = state.open_frame {
            return open;
        }
        let frame_id = state.next_frame_id;
        state.next_frame_id += 1;
        state.open_frame = Some(frame_id);
        if let Some(hint) = self.balancer.pending_hint() {
            debug!(frame_id, weights = ?hint.weights(), "latched balancing weights");
            state.hint = Some(hint);
        }
        frame_id
    }

    pub fn current_frame(&self) -> Option<u64> {
        lock(&self.state).open_frame
    }

    pub fn last_submitted_frame(&self) -> Option<SubmittedFrame> {
        lock(&self.state).last_submitted.clone()
    }

    /// Turn region dependencies into barriers. The resulting waits and signals ride along with
    /// the next frame handed to [`Self::distribute_command_buffers`].
    pub fn insert_gpu_synchronization_points(
        &self,
        dependencies: &[RegionDependency],
    ) -> Result<Vec<InterGpuBarrier>, SyncError> {
        dependencies
            .iter()
            .map(|dep| {
                self.synchronizer.insert_barrier(
                    dep.producer,
                    dep.consumer,
                    dep.producer_stage,
                    dep.consumer_stage,
                )
            })
            .collect()
    }

    /// Hand one frame's command buffers to the devices that own them.
    ///
    /// Each device with work (or with pending barrier primitives) gets one submission carrying
    /// its pending waits and signals plus the frame-complete signal. Returns the frame id.
    pub fn distribute_command_buffers(
        &self,
        command_buffers: Vec<CommandBuffer>,
    ) -> Result<u64, MultiGpuError> {
        let frame_id = self.begin_frame();
        let regions = self.compute_frame_regions();
        let device_count = self.directory.active_device_count();

        let mut per_device: BTreeMap<DeviceIndex, Vec<CommandBuffer>> = BTreeMap::new();
        for cb in command_buffers {
            let device = cb.device();
            if !self.directory.contains(device) {
                return Err(SubmitError::InvalidDevice(device).into());
            }
            if !regions.iter().any(|r| r.device == device) {
                warn!(%device, frame_id, "command buffer targets a device with no region this frame");
            }
            per_device.entry(device).or_default().push(cb);
        }

        let mut submissions = Vec::new();
        for index in 0..device_count {
            let device = DeviceIndex(index);
            let buffers = per_device.remove(&device).unwrap_or_default();
            let pending = self.synchronizer.take_pending_primitives(device)?;
            if buffers.is_empty() && pending.is_empty() {
                continue;
            }
            let mut signals = pending.signals;
            signals.push(SignalPrimitive::FrameComplete { frame_id });
            submissions.push(
                GpuCommandSubmission::new(device, buffers)
                    .with_waits(pending.waits)
                    .with_signals(signals),
            );
        }

        let devices: Vec<DeviceIndex> = submissions.iter().map(|s| s.device).collect();
        self.commands.submit_multi_gpu_frame(submissions)?;

        let mut state = lock(&self.state);
        state.open_frame = None;
        state.last_submitted = Some(SubmittedFrame {
            frame_id,
            devices: devices.clone(),
        });
        drop(state);

        self.stats.inc_frames_distributed();
        debug!(frame_id, devices = ?devices, "frame distributed");
        Ok(frame_id)
    }

    /// Block until every device that took part in the last distributed frame has finished it.
    pub fn synchronize_frame_completion(&self) -> Result<(), SyncError> {
        let Some(frame) = self.last_submitted_frame() else {
            return Ok(());
        };
        for device in &frame.devices {
            self.synchronizer
                .wait_for_frame_complete(*device, frame.frame_id)?;
        }
        debug!(frame_id = frame.frame_id, "frame complete on all devices");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MultiGpuConfig, MultiGpuContext, SoftDeviceDirectory};
    use pretty_assertions::assert_eq;

    fn context(devices: u32) -> MultiGpuContext {
        let directory = Arc::new(SoftDeviceDirectory::with_devices(devices));
        let config = MultiGpuConfig {
            device_count: devices,
            ..MultiGpuConfig::default()
        };
        MultiGpuContext::new(directory, config).expect("context")
    }

    #[test]
    fn mode_names_round_trip_through_from_str() {
        for mode in DistributionMode::ALL {
            assert_eq!(mode.to_string().parse::<DistributionMode>().unwrap(), mode);
        }
        assert!(matches!(
            "diagonal".parse::<DistributionMode>(),
            Err(ConfigError::UnknownMode(_))
        ));
    }

    #[test]
    fn unknown_raw_mode_falls_back_to_horizontal() {
        assert_eq!(DistributionMode::from_raw(3), DistributionMode::AlternateFrame);
        assert_eq!(DistributionMode::from_raw(99), DistributionMode::HorizontalSplit);
    }

    #[test]
    fn regions_are_memoised_until_inputs_change() {
        let ctx = context(3);
        let frames = ctx.frames();
        frames.set_frame_resolution(1920, 1080).unwrap();

        let a = frames.compute_frame_regions();
        let b = frames.compute_frame_regions();
        assert!(Arc::ptr_eq(&a, &b));

        frames.set_frame_resolution(3840, 2160).unwrap();
        let c = frames.compute_frame_regions();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c[0].width, 1280);

        frames.set_distribution_mode(DistributionMode::VerticalSplit);
        let d = frames.compute_frame_regions();
        assert_eq!(d[0].height, 720);
        assert_eq!(d[0].width, 3840);
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let ctx = context(2);
        assert_eq!(
            ctx.frames().set_frame_resolution(0, 1080),
            Err(ConfigError::ZeroResolution {
                width: 0,
                height: 1080
            })
        );
    }

    #[test]
    fn region_for_unassigned_device_is_empty() {
        let ctx = context(6);
        let frames = ctx.frames();
        frames.set_frame_resolution(100, 100).unwrap();
        frames.set_distribution_mode(DistributionMode::QuadrantSplit);

        assert_eq!(frames.region_for_gpu(DeviceIndex(1)), FrameRegion::new(50, 0, 50, 50, DeviceIndex(1)));
        let spare = frames.region_for_gpu(DeviceIndex(5));
        assert!(spare.is_empty());
        assert_eq!(spare.device, DeviceIndex(5));
    }

    #[test]
    fn begin_frame_is_idempotent_until_distributed() {
        let ctx = context(2);
        let frames = ctx.frames();
        frames.set_frame_resolution(64, 64).unwrap();

        let first = frames.begin_frame();
        assert_eq!(frames.begin_frame(), first);
        assert_eq!(frames.distribute_command_buffers(Vec::new()).unwrap(), first);
        assert_eq!(frames.begin_frame(), first + 1);
    }

    #[test]
    fn distributed_frame_completes_on_participating_devices() {
        let ctx = context(3);
        let frames = ctx.frames();
        frames.set_frame_resolution(300, 10).unwrap();

        let mut buffers = Vec::new();
        for region in frames.compute_frame_regions().iter() {
            let mut rec = ctx.commands().begin_command_buffer(region.device).unwrap();
            rec.draw(*region, 1);
            buffers.push(ctx.commands().end_command_buffer(rec));
        }
        let frame_id = frames.distribute_command_buffers(buffers).unwrap();
        frames.synchronize_frame_completion().unwrap();

        let submitted = frames.last_submitted_frame().unwrap();
        assert_eq!(submitted.frame_id, frame_id);
        assert_eq!(submitted.devices.len(), 3);
        for device in ctx.directory().devices() {
            assert!(ctx.synchronizer().frame_completion_counter(device.index).unwrap() >= frame_id);
        }
    }

    #[test]
    fn regions_recorded_before_the_frame_opens_match_distribution() {
        let ctx = context(2);
        let frames = ctx.frames();
        frames.set_frame_resolution(1000, 100).unwrap();
        frames.set_distribution_mode(DistributionMode::OptimizedSplit);

        let record = |regions: &[FrameRegion]| -> Vec<CommandBuffer> {
            regions
                .iter()
                .map(|r| {
                    let mut rec = ctx.commands().begin_command_buffer(r.device).unwrap();
                    rec.draw(*r, 1);
                    ctx.commands().end_command_buffer(rec)
                })
                .collect()
        };

        let first = frames.compute_frame_regions();
        frames.distribute_command_buffers(record(&first)).unwrap();
        frames.synchronize_frame_completion().unwrap();
        ctx.commands().balance_workload_across_gpus(&[100, 300]).unwrap();

        // No explicit begin_frame: compute, record, distribute.
        let recorded = frames.compute_frame_regions();
        let widths: Vec<u32> = recorded.iter().map(|r| r.width).collect();
        assert_eq!(widths, vec![750, 250]);
        frames.distribute_command_buffers(record(&recorded)).unwrap();
        assert_eq!(frames.region_for_gpu(DeviceIndex(0)).width, 750);
        assert!(Arc::ptr_eq(&recorded, &frames.compute_frame_regions()));
        frames.synchronize_frame_completion().unwrap();
    }

    #[test]
    fn buffers_for_inactive_devices_are_rejected() {
        let ctx = context(2);
        let frames = ctx.frames();
        frames.set_frame_resolution(64, 64).unwrap();

        let rec = ctx.commands().begin_command_buffer(DeviceIndex(7));
        assert!(rec.is_err());
    }
}
