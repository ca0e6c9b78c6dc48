//! Workload balancing feedback.
//!
//! Policy: each device's reported workload is folded into an exponential moving average, and the
//! next partition gives each device a share of the frame inversely proportional to that average.
//! Shares are quantized to basis points ([`PartitionHint::SCALE`]) and always sum to exactly
//! `SCALE`. A device never drops below one basis point.
//!
//! The balancer only publishes a hint. [`crate::FrameDistributor::begin_frame`] latches it, so a
//! hint recorded during frame N shapes frame N+1 and nothing on the submission path reads it.

use std::sync::Mutex;

use tracing::debug;

use crate::sync::lock;

/// Relative partition weights, one per device, in basis points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionHint {
    weights: Vec<u32>,
}

impl PartitionHint {
    pub const SCALE: u32 = 10_000;

    pub fn equal(device_count: u32) -> Self {
        Self::from_inverse(&vec![1.0; device_count as usize])
    }

    /// Weights inversely proportional to `averages`. Non-positive averages count as 1.
    pub fn from_averages(averages: &[f64]) -> Self {
        let inverse: Vec<f64> = averages
            .iter()
            .map(|a| if a.is_finite() && *a >= 1.0 { 1.0 / a } else { 1.0 })
            .collect();
        Self::from_inverse(&inverse)
    }

    fn from_inverse(inverse: &[f64]) -> Self {
        if inverse.is_empty() {
            return Self {
                weights: Vec::new(),
            };
        }
        let total: f64 = inverse.iter().sum();
        let scale = f64::from(Self::SCALE);
        let mut weights: Vec<u32> = inverse
            .iter()
            .map(|v| ((v / total) * scale).round().max(1.0) as u32)
            .collect();

        // Rounding and the one-basis-point floor can miss SCALE by a few units; settle the
        // difference on the heaviest device.
        let sum: i64 = weights.iter().map(|w| i64::from(*w)).sum();
        let diff = i64::from(Self::SCALE) - sum;
        if diff != 0 {
            if let Some(heaviest) = weights
                .iter_mut()
                .max_by_key(|w| **w)
            {
                *heaviest = (i64::from(*heaviest) + diff).max(1) as u32;
            }
        }
        Self { weights }
    }

    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    pub fn device_count(&self) -> usize {
        self.weights.len()
    }
}

#[derive(Debug, Default)]
struct BalancerState {
    averages: Vec<f64>,
    pending: Option<PartitionHint>,
    updates: u64,
}

#[derive(Debug)]
pub struct WorkloadBalancer {
    smoothing: f64,
    state: Mutex<BalancerState>,
}

impl WorkloadBalancer {
    /// `smoothing` is the weight of the newest sample, clamped into `(0, 1]`.
    pub fn new(smoothing: f64) -> Self {
        let smoothing = if smoothing.is_finite() {
            smoothing.clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            1.0
        };
        Self {
            smoothing,
            state: Mutex::new(BalancerState::default()),
        }
    }

    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }

    /// Fold one workload sample per device into the moving averages and publish a new hint.
    ///
    /// A sample whose length differs from the previous one restarts the averages.
    pub fn record_workloads(&self, workloads: &[u32]) -> PartitionHint {
        let sample = workloads.iter().map(|w| f64::from((*w).max(1)));
        let mut state = lock(&self.state);
        if state.averages.len() != workloads.len() {
            state.averages = sample.collect();
        } else {
            let a = self.smoothing;
            for (avg, w) in state.averages.iter_mut().zip(sample) {
                *avg = a * w + (1.0 - a) * *avg;
            }
        }

        let hint = PartitionHint::from_averages(&state.averages);
        state.pending = Some(hint.clone());
        state.updates += 1;
        debug!(workloads = ?workloads, weights = ?hint.weights(), "rebalanced partition");
        hint
    }

    /// Latest published hint, if any sample has been recorded.
    pub fn pending_hint(&self) -> Option<PartitionHint> {
        lock(&self.state).pending.clone()
    }

    pub fn rolling_averages(&self) -> Vec<f64> {
        lock(&self.state).averages.clone()
    }

    pub fn updates(&self) -> u64 {
        lock(&self.state).updates
    }

    pub fn reset(&self) {
        *lock(&self.state) = BalancerState::default();
    }
}
