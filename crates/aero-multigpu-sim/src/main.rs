#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use aero_multigpu::{
    parse_resolution, DeviceIndex, DistributionMode, FrameRegion, MultiGpuConfig, MultiGpuContext,
    MultiGpuStatsSnapshot, RegionDependency, SoftDeviceDirectory, SoftDirectoryOptions,
};
use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(
    name = "aero-multigpu-sim",
    about = "Drive split-frame rendering across simulated GPUs and report partitions, balancing and stats."
)]
struct Args {
    /// Number of frames to render
    #[arg(long, default_value_t = 8)]
    frames: u32,

    /// Distribution mode (horizontal, vertical, quadrant, afr, optimized); defaults to AERO_MULTIGPU_MODE
    #[arg(long)]
    mode: Option<DistributionMode>,

    /// Number of simulated devices; defaults to AERO_MULTIGPU_DEVICES
    #[arg(long)]
    devices: Option<u32>,

    /// Frame resolution as WIDTHxHEIGHT; defaults to AERO_MULTIGPU_RESOLUTION
    #[arg(long, value_name = "WxH", value_parser = resolution_arg)]
    resolution: Option<(u32, u32)>,

    /// Per-device slowdown factors, e.g. `1,1,2.5`
    #[arg(long, value_delimiter = ',')]
    speed: Vec<f64>,

    /// Simulated time per unit of draw cost, in microseconds
    #[arg(long, value_name = "US", default_value_t = 50)]
    cost_unit_us: u64,

    /// Draw cost units per megapixel of region area
    #[arg(long, default_value_t = 20)]
    cost_per_mpixel: u32,

    /// Feed measured device times back into the partition after every frame
    #[arg(long, action = clap::ArgAction::SetTrue)]
    balance: bool,

    /// Make every other device consume device 0's output each frame
    #[arg(long, action = clap::ArgAction::SetTrue)]
    barriers: bool,

    /// Print the full report as JSON instead of text
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,
}

fn resolution_arg(raw: &str) -> Result<(u32, u32), String> {
    match parse_resolution(raw) {
        Some((w, h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => Err(format!("expected WIDTHxHEIGHT, got {raw:?}")),
    }
}

#[derive(Debug, Serialize)]
struct FrameReport {
    frame_id: u64,
    regions: Vec<FrameRegion>,
    device_times_us: Vec<u64>,
    /// Balancing weights published after this frame.
    weights: Option<Vec<u32>>,
    failed_submissions: usize,
    stalled: Vec<DeviceIndex>,
}

#[derive(Debug, Serialize)]
struct SimReport {
    mode: DistributionMode,
    devices: u32,
    async_compute: Vec<DeviceIndex>,
    width: u32,
    height: u32,
    frames: Vec<FrameReport>,
    stats: MultiGpuStatsSnapshot,
}

fn config_from(args: &Args) -> anyhow::Result<MultiGpuConfig> {
    let mut config = MultiGpuConfig::from_env().context("reading AERO_MULTIGPU_* settings")?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(devices) = args.devices {
        config.device_count = devices;
    }
    if let Some((width, height)) = args.resolution {
        config.width = width;
        config.height = height;
    }
    config.validate()?;
    Ok(config)
}

fn region_cost(region: &FrameRegion, cost_per_mpixel: u32) -> u32 {
    let cost = region.area() * u64::from(cost_per_mpixel) / 1_000_000;
    cost.clamp(1, u64::from(u32::MAX)) as u32
}

fn run(args: &Args, config: MultiGpuConfig) -> anyhow::Result<SimReport> {
    if args.frames == 0 {
        bail!("--frames must be at least 1");
    }
    let soft = Arc::new(SoftDeviceDirectory::new(SoftDirectoryOptions {
        device_count: config.device_count,
        speed_factors: args.speed.clone(),
        cost_unit: Duration::from_micros(args.cost_unit_us),
        ..SoftDirectoryOptions::default()
    }));
    let ctx = MultiGpuContext::new(soft, config.clone())?;
    let frames = ctx.frames();
    let commands = ctx.commands();
    let device_count = ctx.device_count();
    let frame_area = u64::from(config.width) * u64::from(config.height);

    let mut reports = Vec::with_capacity(args.frames as usize);
    for _ in 0..args.frames {
        let frame_id = frames.begin_frame();
        let regions = frames.compute_frame_regions();

        if args.barriers {
            let deps: Vec<RegionDependency> = (1..device_count)
                .map(|i| RegionDependency::new(DeviceIndex(0), DeviceIndex(i)))
                .collect();
            frames.insert_gpu_synchronization_points(&deps)?;
        }

        let mut buffers = Vec::new();
        for region in regions.iter().filter(|r| !r.is_empty()) {
            let mut rec = commands.begin_command_buffer(region.device)?;
            rec.marker(format!("frame-{frame_id}"))
                .draw(*region, region_cost(region, args.cost_per_mpixel));
            buffers.push(commands.end_command_buffer(rec));
        }
        frames.distribute_command_buffers(buffers)?;

        let mut stalled = Vec::new();
        let participants = frames
            .last_submitted_frame()
            .map(|f| f.devices)
            .unwrap_or_default();
        for device in &participants {
            if !commands.wait_for_gpu_completion(*device, config.completion_timeout)? {
                tracing::warn!(
                    %device,
                    frame_id,
                    action = ?commands.recommend_recovery(*device),
                    "device missed the completion deadline"
                );
                stalled.push(*device);
            }
        }
        if stalled.is_empty() {
            frames.synchronize_frame_completion()?;
        }

        let failed_submissions = commands
            .drain_completions()
            .iter()
            .filter(|c| c.error.is_some())
            .count();
        let times = commands.last_frame_device_times();

        let weights = if args.balance {
            // Project each device's time onto the whole frame so the estimate tracks device speed
            // rather than the size of the region it happened to get.
            let workloads: Vec<u32> = (0..device_count)
                .map(|i| {
                    let area = regions
                        .iter()
                        .find(|r| r.device == DeviceIndex(i))
                        .map_or(0, FrameRegion::area);
                    let micros = times.get(i as usize).map_or(0, |t| t.as_micros());
                    if area == 0 {
                        return u32::MAX;
                    }
                    (micros * u128::from(frame_area) / u128::from(area)).min(u128::from(u32::MAX))
                        as u32
                })
                .collect();
            Some(commands.balance_workload_across_gpus(&workloads)?.weights().to_vec())
        } else {
            None
        };

        reports.push(FrameReport {
            frame_id,
            regions: regions.to_vec(),
            device_times_us: times.iter().map(|t| t.as_micros() as u64).collect(),
            weights,
            failed_submissions,
            stalled,
        });
    }

    Ok(SimReport {
        mode: config.mode,
        devices: device_count,
        async_compute: ctx.async_compute_devices(),
        width: config.width,
        height: config.height,
        frames: reports,
        stats: ctx.stats().snapshot(),
    })
}

fn print_text(report: &SimReport) {
    println!(
        "{} devices, {}x{}, mode {}",
        report.devices, report.width, report.height, report.mode
    );
    println!("async compute: {:?}", report.async_compute);
    for frame in &report.frames {
        let regions: Vec<String> = frame
            .regions
            .iter()
            .map(|r| {
                format!(
                    "{}:({},{} {}x{})",
                    r.device, r.offset_x, r.offset_y, r.width, r.height
                )
            })
            .collect();
        println!(
            "frame {}: {} times_us={:?}",
            frame.frame_id,
            regions.join(" "),
            frame.device_times_us
        );
        if let Some(weights) = &frame.weights {
            println!("  next weights: {weights:?}");
        }
        if frame.failed_submissions > 0 || !frame.stalled.is_empty() {
            println!(
                "  failed submissions: {}, stalled: {:?}",
                frame.failed_submissions, frame.stalled
            );
        }
    }
    println!("stats: {}", report.stats.to_json());
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = config_from(&args)?;
    let report = run(&args, config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}
