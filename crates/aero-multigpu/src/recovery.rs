use std::sync::Mutex;

use tracing::warn;

use crate::sync::lock;
use crate::DeviceIndex;

/// What a caller should do about a device that missed a completion deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No outstanding timeouts.
    KeepWaiting,
    /// Present the frame without this device's region.
    SkipRegion,
    /// Stop splitting frames and render on one healthy device.
    FallBackToSingleDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    Stalled { consecutive_timeouts: u32 },
}

/// Per-device streaks of completion timeouts.
///
/// A successful completion wait clears the streak. Once a streak reaches the threshold the
/// recommendation escalates from skipping the region to single-device fallback.
#[derive(Debug)]
pub struct StallTracker {
    threshold: u32,
    streaks: Mutex<Vec<u32>>,
}

impl StallTracker {
    pub fn new(device_count: u32, threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            streaks: Mutex::new(vec![0; device_count as usize]),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Returns the new streak length, or `None` for an unknown device.
    pub fn record_timeout(&self, device: DeviceIndex) -> Option<u32> {
        let mut streaks = lock(&self.streaks);
        let streak = streaks.get_mut(device.as_usize())?;
        *streak = streak.saturating_add(1);
        if *streak == self.threshold {
            warn!(%device, timeouts = *streak, "device considered stalled");
        }
        Some(*streak)
    }

    pub fn record_completion(&self, device: DeviceIndex) {
        if let Some(streak) = lock(&self.streaks).get_mut(device.as_usize()) {
            *streak = 0;
        }
    }

    pub fn health(&self, device: DeviceIndex) -> Option<DeviceHealth> {
        let streak = *lock(&self.streaks).get(device.as_usize())?;
        Some(match streak {
            0 => DeviceHealth::Healthy,
            n => DeviceHealth::Stalled {
                consecutive_timeouts: n,
            },
        })
    }

    pub fn recommend(&self, device: DeviceIndex) -> Option<RecoveryAction> {
        let streak = *lock(&self.streaks).get(device.as_usize())?;
        Some(if streak == 0 {
            RecoveryAction::KeepWaiting
        } else if streak < self.threshold {
            RecoveryAction::SkipRegion
        } else {
            RecoveryAction::FallBackToSingleDevice
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalates_after_threshold_and_resets_on_completion() {
        let tracker = StallTracker::new(2, 3);
        let d = DeviceIndex(1);
        assert_eq!(tracker.recommend(d), Some(RecoveryAction::KeepWaiting));

        tracker.record_timeout(d);
        assert_eq!(tracker.recommend(d), Some(RecoveryAction::SkipRegion));
        tracker.record_timeout(d);
        assert_eq!(tracker.record_timeout(d), Some(3));
        assert_eq!(tracker.recommend(d), Some(RecoveryAction::FallBackToSingleDevice));
        assert_eq!(
            tracker.health(d),
            Some(DeviceHealth::Stalled {
                consecutive_timeouts: 3
            })
        );
        assert_eq!(tracker.health(DeviceIndex(0)), Some(DeviceHealth::Healthy));

        tracker.record_completion(d);
        assert_eq!(tracker.health(d), Some(DeviceHealth::Healthy));
    }

    #[test]
    fn unknown_devices_are_ignored() {
        let tracker = StallTracker::new(1, 3);
        assert_eq!(tracker.record_timeout(DeviceIndex(4)), None);
        assert_eq!(tracker.recommend(DeviceIndex(4)), None);
    }
}
