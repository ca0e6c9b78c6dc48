use std::sync::Arc;

use tracing::info;

use crate::{
    CommandBuffer, CommandDistributor, ConfigError, DeviceDirectory, DeviceError, DeviceIndex,
    DeviceInfo, FrameDistributor, MemoryDescriptor, MemoryHandle, MemoryPlacementManager,
    MemorySpan, MultiGpuConfig, MultiGpuError, MultiGpuStats, MultiGpuSynchronizer,
    WorkloadBalancer,
};

/// The four multi-GPU components built around one shared [`DeviceDirectory`].
pub struct MultiGpuContext {
    config: MultiGpuConfig,
    directory: Arc<dyn DeviceDirectory>,
    stats: Arc<MultiGpuStats>,
    synchronizer: Arc<MultiGpuSynchronizer>,
    balancer: Arc<WorkloadBalancer>,
    commands: Arc<CommandDistributor>,
    frames: Arc<FrameDistributor>,
    memory: MemoryPlacementManager,
}

impl std::fmt::Debug for MultiGpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiGpuContext")
            .field("config", &self.config)
            .field("devices", &self.directory.active_device_count())
            .finish_non_exhaustive()
    }
}

impl MultiGpuContext {
    /// Build every component and apply `config`.
    ///
    /// Only the first `config.device_count` directory devices participate; a directory with
    /// fewer devices limits the count instead.
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        config: MultiGpuConfig,
    ) -> Result<Self, MultiGpuError> {
        config.validate()?;
        let available = directory.active_device_count();
        if available == 0 {
            return Err(ConfigError::NoDevices.into());
        }
        let device_count = config.device_count.min(available);
        let directory: Arc<dyn DeviceDirectory> = if device_count < available {
            Arc::new(DeviceSubset {
                inner: directory,
                count: device_count,
            })
        } else {
            directory
        };

        for device in directory.devices() {
            info!(
                device = %device.index,
                name = %device.name,
                async_compute = directory.supports_async_compute_on_device(device.index),
                "multi-gpu device"
            );
        }

        let stats = Arc::new(MultiGpuStats::new());
        let synchronizer = Arc::new(MultiGpuSynchronizer::new(directory.as_ref(), stats.clone()));
        let balancer = Arc::new(WorkloadBalancer::new(config.balance_smoothing));
        let commands = Arc::new(CommandDistributor::new(
            directory.clone(),
            synchronizer.clone(),
            balancer.clone(),
            stats.clone(),
            config.stall_threshold,
        )?);
        let frames = Arc::new(FrameDistributor::new(
            directory.clone(),
            synchronizer.clone(),
            commands.clone(),
            balancer.clone(),
            stats.clone(),
        ));
        frames.set_distribution_mode(config.mode);
        frames.set_frame_resolution(config.width, config.height)?;
        let memory = MemoryPlacementManager::new(directory.clone(), frames.clone(), stats.clone());

        info!(
            devices = device_count,
            mode = %config.mode,
            width = config.width,
            height = config.height,
            "multi-gpu context ready"
        );
        Ok(Self {
            config,
            directory,
            stats,
            synchronizer,
            balancer,
            commands,
            frames,
            memory,
        })
    }

    pub fn config(&self) -> &MultiGpuConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    pub fn device_count(&self) -> u32 {
        self.directory.active_device_count()
    }

    /// Devices that expose a dedicated compute queue.
    pub fn async_compute_devices(&self) -> Vec<DeviceIndex> {
        (0..self.device_count())
            .map(DeviceIndex)
            .filter(|d| self.directory.supports_async_compute_on_device(*d))
            .collect()
    }

    pub fn stats(&self) -> &Arc<MultiGpuStats> {
        &self.stats
    }

    pub fn synchronizer(&self) -> &Arc<MultiGpuSynchronizer> {
        &self.synchronizer
    }

    pub fn balancer(&self) -> &Arc<WorkloadBalancer> {
        &self.balancer
    }

    pub fn commands(&self) -> &Arc<CommandDistributor> {
        &self.commands
    }

    pub fn frames(&self) -> &Arc<FrameDistributor> {
        &self.frames
    }

    pub fn memory(&self) -> &MemoryPlacementManager {
        &self.memory
    }
}

/// The first `count` devices of another directory.
struct DeviceSubset {
    inner: Arc<dyn DeviceDirectory>,
    count: u32,
}

impl DeviceSubset {
    fn check(&self, device: DeviceIndex) -> Result<(), DeviceError> {
        if device.0 < self.count {
            Ok(())
        } else {
            Err(DeviceError::InvalidDevice(device))
        }
    }
}

impl DeviceDirectory for DeviceSubset {
    fn active_device_count(&self) -> u32 {
        self.count
    }

    fn device_by_index(&self, index: DeviceIndex) -> Option<DeviceInfo> {
        self.check(index).ok()?;
        self.inner.device_by_index(index)
    }

    fn supports_async_compute_on_device(&self, index: DeviceIndex) -> bool {
        self.check(index).is_ok() && self.inner.supports_async_compute_on_device(index)
    }

    fn supports_peer_access(&self, src: DeviceIndex, dst: DeviceIndex) -> bool {
        self.check(src).is_ok() && self.check(dst).is_ok() && self.inner.supports_peer_access(src, dst)
    }

    fn allocate_raw_memory(
        &self,
        device: DeviceIndex,
        descriptor: &MemoryDescriptor,
    ) -> Result<MemoryHandle, DeviceError> {
        self.check(device)?;
        self.inner.allocate_raw_memory(device, descriptor)
    }

    fn free_raw_memory(&self, device: DeviceIndex, memory: MemoryHandle) -> Result<(), DeviceError> {
        self.check(device)?;
        self.inner.free_raw_memory(device, memory)
    }

    fn read_raw_memory(&self, span: MemorySpan, dst: &mut [u8]) -> Result<(), DeviceError> {
        self.check(span.device)?;
        self.inner.read_raw_memory(span, dst)
    }

    fn write_raw_memory(&self, span: MemorySpan, src: &[u8]) -> Result<(), DeviceError> {
        self.check(span.device)?;
        self.inner.write_raw_memory(span, src)
    }

    fn copy_raw_memory_peer(&self, src: MemorySpan, dst: MemorySpan, len: u64) -> Result<(), DeviceError> {
        self.check(src.device)?;
        self.check(dst.device)?;
        self.inner.copy_raw_memory_peer(src, dst, len)
    }

    fn execute_command_buffer(
        &self,
        device: DeviceIndex,
        command_buffer: &CommandBuffer,
    ) -> Result<(), DeviceError> {
        self.check(device)?;
        self.inner.execute_command_buffer(device, command_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DistributionMode, SoftDeviceDirectory, SoftDirectoryOptions};

    #[test]
    fn config_device_count_limits_participants() {
        let soft = Arc::new(SoftDeviceDirectory::with_devices(4));
        let config = MultiGpuConfig {
            device_count: 2,
            mode: DistributionMode::VerticalSplit,
            ..MultiGpuConfig::default()
        };
        let ctx = MultiGpuContext::new(soft, config).unwrap();
        assert_eq!(ctx.device_count(), 2);
        assert_eq!(ctx.frames().compute_frame_regions().len(), 2);
        assert_eq!(ctx.frames().distribution_mode(), DistributionMode::VerticalSplit);
        assert!(ctx.commands().begin_command_buffer(DeviceIndex(3)).is_err());
    }

    #[test]
    fn async_compute_follows_the_directory() {
        let with = Arc::new(SoftDeviceDirectory::with_devices(4));
        let config = MultiGpuConfig {
            device_count: 2,
            ..MultiGpuConfig::default()
        };
        let ctx = MultiGpuContext::new(with, config).unwrap();
        assert_eq!(ctx.async_compute_devices(), vec![DeviceIndex(0), DeviceIndex(1)]);

        let without = Arc::new(SoftDeviceDirectory::new(SoftDirectoryOptions {
            async_compute: false,
            ..SoftDirectoryOptions::with_devices(2)
        }));
        let ctx = MultiGpuContext::new(without, MultiGpuConfig::default()).unwrap();
        assert!(ctx.async_compute_devices().is_empty());
    }

    #[test]
    fn directory_smaller_than_config_is_used_whole() {
        let soft = Arc::new(SoftDeviceDirectory::with_devices(2));
        let ctx = MultiGpuContext::new(soft, MultiGpuConfig::default()).unwrap();
        assert_eq!(ctx.device_count(), 2);
    }

    #[test]
    fn empty_directory_is_rejected() {
        let soft = Arc::new(SoftDeviceDirectory::with_devices(0));
        assert!(matches!(
            MultiGpuContext::new(soft, MultiGpuConfig::default()),
            Err(MultiGpuError::Config(ConfigError::NoDevices))
        ));
    }
}
