//! Pure partition algorithms.
//!
//! Every function here is a deterministic function of its arguments. For a non-empty frame and
//! at least one device the returned regions tile `[0, width) x [0, height)` exactly.

use crate::{DeviceIndex, DistributionMode, FrameRegion, PartitionHint};

/// Everything a partition depends on. Two equal keys always produce the same regions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub mode: DistributionMode,
    pub width: u32,
    pub height: u32,
    pub device_count: u32,
    /// Device owning the whole frame in [`DistributionMode::AlternateFrame`].
    pub afr_device: Option<DeviceIndex>,
    /// Latched balancing weights for [`DistributionMode::OptimizedSplit`].
    pub weights: Option<Vec<u32>>,
}

impl PartitionKey {
    pub fn new(mode: DistributionMode, width: u32, height: u32, device_count: u32) -> Self {
        Self {
            mode,
            width,
            height,
            device_count,
            afr_device: None,
            weights: None,
        }
    }

    /// Key for frame `frame_id`, pulling in only the history the mode actually uses.
    pub fn for_frame(
        mode: DistributionMode,
        width: u32,
        height: u32,
        device_count: u32,
        frame_id: u64,
        hint: Option<&PartitionHint>,
    ) -> Self {
        let mut key = Self::new(mode, width, height, device_count);
        match mode {
            DistributionMode::AlternateFrame if device_count > 0 => {
                let slot = frame_id.saturating_sub(1) % u64::from(device_count);
                key.afr_device = Some(DeviceIndex(slot as u32));
            }
            DistributionMode::OptimizedSplit => {
                key.weights = hint
                    .filter(|h| h.weights().len() == device_count as usize)
                    .map(|h| h.weights().to_vec());
            }
            _ => {}
        }
        key
    }
}

pub fn compute_regions(key: &PartitionKey) -> Vec<FrameRegion> {
    let PartitionKey {
        mode,
        width,
        height,
        device_count,
        ..
    } = *key;
    if width == 0 || height == 0 || device_count == 0 {
        return Vec::new();
    }

    match mode {
        DistributionMode::HorizontalSplit => horizontal_split(width, height, device_count),
        DistributionMode::VerticalSplit => vertical_split(width, height, device_count),
        DistributionMode::QuadrantSplit => quadrant_split(width, height, device_count),
        DistributionMode::AlternateFrame => {
            let device = key.afr_device.unwrap_or_default();
            vec![FrameRegion::new(0, 0, width, height, device)]
        }
        DistributionMode::OptimizedSplit => match &key.weights {
            Some(weights) if weights.len() == device_count as usize => {
                weighted_split(width, height, weights)
            }
            _ => horizontal_split(width, height, device_count),
        },
    }
}

/// Equal-width vertical strips, left to right; the last strip absorbs the remainder.
pub fn horizontal_split(width: u32, height: u32, device_count: u32) -> Vec<FrameRegion> {
    if device_count == 0 {
        return Vec::new();
    }
    let strip = width / device_count;
    (0..device_count)
        .map(|i| {
            let offset_x = i * strip;
            let w = if i == device_count - 1 {
                width - offset_x
            } else {
                strip
            };
            FrameRegion::new(offset_x, 0, w, height, DeviceIndex(i))
        })
        .collect()
}

/// Equal-height horizontal strips, top to bottom; the last strip absorbs the remainder.
pub fn vertical_split(width: u32, height: u32, device_count: u32) -> Vec<FrameRegion> {
    if device_count == 0 {
        return Vec::new();
    }
    let strip = height / device_count;
    (0..device_count)
        .map(|i| {
            let offset_y = i * strip;
            let h = if i == device_count - 1 {
                height - offset_y
            } else {
                strip
            };
            FrameRegion::new(0, offset_y, width, h, DeviceIndex(i))
        })
        .collect()
}

/// Four fixed quadrants; right and bottom quadrants absorb odd pixels.
///
/// Devices beyond the fourth get no region. With fewer than four devices the quadrants are
/// merged along the quadrant grid so the frame stays covered: one device takes the whole frame,
/// two devices split top/bottom, three devices take the top quadrants and the bottom half.
pub fn quadrant_split(width: u32, height: u32, device_count: u32) -> Vec<FrameRegion> {
    let half_w = width / 2;
    let half_h = height / 2;
    let right_w = width - half_w;
    let bottom_h = height - half_h;
    let d = DeviceIndex;

    match device_count {
        0 => Vec::new(),
        1 => vec![FrameRegion::new(0, 0, width, height, d(0))],
        2 => vec![
            FrameRegion::new(0, 0, width, half_h, d(0)),
            FrameRegion::new(0, half_h, width, bottom_h, d(1)),
        ],
        3 => vec![
            FrameRegion::new(0, 0, half_w, half_h, d(0)),
            FrameRegion::new(half_w, 0, right_w, half_h, d(1)),
            FrameRegion::new(0, half_h, width, bottom_h, d(2)),
        ],
        _ => vec![
            FrameRegion::new(0, 0, half_w, half_h, d(0)),
            FrameRegion::new(half_w, 0, right_w, half_h, d(1)),
            FrameRegion::new(0, half_h, half_w, bottom_h, d(2)),
            FrameRegion::new(half_w, half_h, right_w, bottom_h, d(3)),
        ],
    }
}

/// Contiguous left-to-right strips with widths proportional to `weights`.
///
/// When `width >= weights.len()` every device keeps at least one column.
pub fn weighted_split(width: u32, height: u32, weights: &[u32]) -> Vec<FrameRegion> {
    let n = weights.len() as u32;
    if n == 0 {
        return Vec::new();
    }
    let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
    if total == 0 {
        return horizontal_split(width, height, n);
    }

    let mut edges = Vec::with_capacity(weights.len() + 1);
    edges.push(0u32);
    let mut cumulative = 0u64;
    for (i, weight) in weights.iter().enumerate() {
        let i = i as u32;
        cumulative += u64::from(*weight);
        let mut edge = if i == n - 1 {
            width
        } else {
            (u64::from(width) * cumulative / total) as u32
        };
        if width >= n {
            let prev = edges[i as usize];
            edge = edge.clamp(prev + 1, width - (n - 1 - i));
        }
        edges.push(edge);
    }

    edges
        .windows(2)
        .enumerate()
        .map(|(i, pair)| FrameRegion::new(pair[0], 0, pair[1] - pair[0], height, DeviceIndex(i as u32)))
        .collect()
}
