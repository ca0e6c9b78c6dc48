use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Telemetry counters shared by all multi-GPU components.
///
/// Updates are relaxed atomic increments, cheap enough for the submission path and safe to read
/// from any thread.
#[derive(Debug, Default)]
pub struct MultiGpuStats {
    frames_distributed: AtomicU64,
    submissions: AtomicU64,
    submission_failures: AtomicU64,
    completion_timeouts: AtomicU64,
    barriers_inserted: AtomicU64,
    events_signaled: AtomicU64,
    peer_copies: AtomicU64,
    host_staged_copies: AtomicU64,
    replications: AtomicU64,
    rebalances: AtomicU64,
    /// Gauge: registered buffers and images.
    live_resources: AtomicU64,
}

impl MultiGpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_frames_distributed(&self) {
        self.frames_distributed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submissions(&self) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submission_failures(&self) {
        self.submission_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_completion_timeouts(&self) {
        self.completion_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_barriers_inserted(&self) {
        self.barriers_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_signaled(&self) {
        self.events_signaled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_peer_copies(&self) {
        self.peer_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_host_staged_copies(&self) {
        self.host_staged_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_replications(&self) {
        self.replications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rebalances(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resource_registered(&self) {
        self.live_resources.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resource_released(&self) {
        // Saturate instead of wrapping if a release ever races ahead of its registration.
        let _ = self
            .live_resources
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> MultiGpuStatsSnapshot {
        MultiGpuStatsSnapshot {
            frames_distributed: self.frames_distributed.load(Ordering::Relaxed),
            submissions: self.submissions.load(Ordering::Relaxed),
            submission_failures: self.submission_failures.load(Ordering::Relaxed),
            completion_timeouts: self.completion_timeouts.load(Ordering::Relaxed),
            barriers_inserted: self.barriers_inserted.load(Ordering::Relaxed),
            events_signaled: self.events_signaled.load(Ordering::Relaxed),
            peer_copies: self.peer_copies.load(Ordering::Relaxed),
            host_staged_copies: self.host_staged_copies.load(Ordering::Relaxed),
            replications: self.replications.load(Ordering::Relaxed),
            rebalances: self.rebalances.load(Ordering::Relaxed),
            live_resources: self.live_resources.load(Ordering::Relaxed),
        }
    }

    /// Returns a JSON object as a string.
    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MultiGpuStatsSnapshot {
    pub frames_distributed: u64,
    pub submissions: u64,
    pub submission_failures: u64,
    pub completion_timeouts: u64,
    pub barriers_inserted: u64,
    pub events_signaled: u64,
    pub peer_copies: u64,
    pub host_staged_copies: u64,
    pub replications: u64,
    pub rebalances: u64,
    pub live_resources: u64,
}

impl MultiGpuStatsSnapshot {
    pub fn to_json(self) -> String {
        serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_json_contains_counters() {
        let stats = MultiGpuStats::new();
        stats.inc_frames_distributed();
        stats.inc_peer_copies();
        stats.inc_peer_copies();
        stats.resource_registered();
        stats.resource_released();
        stats.resource_released();

        let json = stats.to_json();
        assert!(json.contains("\"frames_distributed\":1"));
        assert!(json.contains("\"peer_copies\":2"));
        assert!(json.contains("\"live_resources\":0"));
    }
}
