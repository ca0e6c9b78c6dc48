//! Shared helpers for `aero-multigpu` integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use aero_multigpu::{
    CommandBuffer, FrameRegion, MultiGpuConfig, MultiGpuContext, SoftDeviceDirectory,
    SoftDirectoryOptions,
};

/// Route `tracing` output through the test harness so it only shows for failing tests.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn context_with(
    options: SoftDirectoryOptions,
    width: u32,
    height: u32,
) -> (Arc<SoftDeviceDirectory>, MultiGpuContext) {
    init_tracing();
    let device_count = options.device_count;
    let soft = Arc::new(SoftDeviceDirectory::new(options));
    let config = MultiGpuConfig {
        device_count: device_count.max(1),
        width,
        height,
        ..MultiGpuConfig::default()
    };
    let ctx = MultiGpuContext::new(soft.clone(), config).expect("build context");
    (soft, ctx)
}

pub fn context(devices: u32, width: u32, height: u32) -> (Arc<SoftDeviceDirectory>, MultiGpuContext) {
    context_with(SoftDirectoryOptions::with_devices(devices), width, height)
}

/// One command buffer per region: a label marker followed by a draw of that region.
pub fn record_frame(ctx: &MultiGpuContext, cost: u32) -> Vec<CommandBuffer> {
    ctx.frames()
        .compute_frame_regions()
        .iter()
        .filter(|r| !r.is_empty())
        .map(|region| record_region(ctx, *region, cost))
        .collect()
}

pub fn record_region(ctx: &MultiGpuContext, region: FrameRegion, cost: u32) -> CommandBuffer {
    let commands = ctx.commands();
    let mut rec = commands
        .begin_command_buffer(region.device)
        .expect("begin command buffer");
    rec.marker(format!("draw-{}", region.device)).draw(region, cost);
    commands.end_command_buffer(rec)
}
