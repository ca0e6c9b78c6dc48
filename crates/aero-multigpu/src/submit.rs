//! Command Distributor: one pending queue and one worker thread per device.
//!
//! A submission is validated and its primitives resolved on the calling thread, then queued for
//! its device. The device worker runs queued submissions strictly in order: it blocks on the
//! submission's waits, executes its command buffers through the [`DeviceDirectory`], then fires
//! its signals and completion fence.
//!
//! Signals and fences fire even when a wait or the execution fails, so no other device can
//! deadlock on a broken submission. Failures are not retried; they are reported through
//! [`CommandDistributor::drain_completions`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::recovery::StallTracker;
use crate::sync::{lock, wait_on, ResolvedSignal, ResolvedWait};
use crate::{
    CommandBuffer, CommandBufferId, CommandRecorder, DeviceDirectory, DeviceHealth, DeviceIndex,
    MultiGpuStats, MultiGpuSynchronizer, PartitionHint, RecoveryAction, SignalPrimitive, SyncError,
    WaitPrimitive, WorkloadBalancer,
};

/// How often a worker blocked on a wait primitive re-checks for shutdown.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("device {0} is not active")]
    InvalidDevice(DeviceIndex),

    #[error("command buffer {buffer:?} was recorded for {actual} but submitted to {expected}")]
    CommandBufferDeviceMismatch {
        buffer: CommandBufferId,
        expected: DeviceIndex,
        actual: DeviceIndex,
    },

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("expected one workload estimate per device ({expected}), got {actual}")]
    WorkloadCount { expected: usize, actual: usize },

    #[error("failed to spawn device worker: {0}")]
    WorkerSpawn(String),
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<bool>,
    cond: Condvar,
}

/// Host-visible fence signaled when a submission finishes executing. Cloning shares the fence.
#[derive(Debug, Clone, Default)]
pub struct CompletionFence {
    inner: Arc<FenceState>,
}

impl CompletionFence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_signaled(&self) -> bool {
        *lock(&self.inner.signaled)
    }

    /// Returns `false` if `timeout` elapsed before the fence signaled.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            wait_on(&self.inner.signaled, &self.inner.cond, Some(timeout), |s| Ok(*s)),
            Ok(true)
        )
    }

    fn signal(&self) {
        *lock(&self.inner.signaled) = true;
        self.inner.cond.notify_all();
    }
}

/// One device's contribution to a frame.
#[derive(Debug, Clone)]
pub struct GpuCommandSubmission {
    pub device: DeviceIndex,
    pub command_buffers: Vec<CommandBuffer>,
    pub waits: Vec<WaitPrimitive>,
    pub signals: Vec<SignalPrimitive>,
    pub completion_fence: Option<CompletionFence>,
}

impl GpuCommandSubmission {
    pub fn new(device: DeviceIndex, command_buffers: Vec<CommandBuffer>) -> Self {
        Self {
            device,
            command_buffers,
            waits: Vec::new(),
            signals: Vec::new(),
            completion_fence: None,
        }
    }

    pub fn with_waits(mut self, waits: Vec<WaitPrimitive>) -> Self {
        self.waits.extend(waits);
        self
    }

    pub fn with_signals(mut self, signals: Vec<SignalPrimitive>) -> Self {
        self.signals.extend(signals);
        self
    }

    pub fn with_fence(mut self, fence: CompletionFence) -> Self {
        self.completion_fence = Some(fence);
        self
    }

    fn frame_id(&self) -> Option<u64> {
        self.signals.iter().find_map(|s| match s {
            SignalPrimitive::FrameComplete { frame_id } => Some(*frame_id),
            _ => None,
        })
    }
}

/// Outcome of one executed submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionCompletion {
    pub device: DeviceIndex,
    pub sequence: u64,
    pub frame_id: Option<u64>,
    /// Time spent executing command buffers, excluding waits.
    pub busy: Duration,
    pub error: Option<String>,
}

#[derive(Debug)]
struct Job {
    sequence: u64,
    frame_id: Option<u64>,
    command_buffers: Vec<CommandBuffer>,
    waits: Vec<ResolvedWait>,
    signals: Vec<ResolvedSignal>,
    fence: Option<CompletionFence>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<Job>,
    next_sequence: u64,
    completed_sequence: u64,
    /// Busy time of the most recent frame this device executed.
    frame_busy: Option<(u64, Duration)>,
}

#[derive(Debug)]
struct DeviceQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl DeviceQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                next_sequence: 1,
                completed_sequence: 0,
                frame_busy: None,
            }),
            cond: Condvar::new(),
        }
    }
}

struct Shared {
    directory: Arc<dyn DeviceDirectory>,
    synchronizer: Arc<MultiGpuSynchronizer>,
    stats: Arc<MultiGpuStats>,
    queues: Vec<DeviceQueue>,
    completions: Mutex<Vec<SubmissionCompletion>>,
    /// Highest frame id queued so far; 0 before the first frame.
    last_frame: AtomicU64,
    shutdown: AtomicBool,
}

pub struct CommandDistributor {
    shared: Arc<Shared>,
    balancer: Arc<WorkloadBalancer>,
    stalls: StallTracker,
    next_command_buffer: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for CommandDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDistributor")
            .field("devices", &self.shared.queues.len())
            .field("stalls", &self.stalls)
            .finish_non_exhaustive()
    }
}

impl CommandDistributor {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        synchronizer: Arc<MultiGpuSynchronizer>,
        balancer: Arc<WorkloadBalancer>,
        stats: Arc<MultiGpuStats>,
        stall_threshold: u32,
    ) -> Result<Self, SubmitError> {
        let device_count = directory.active_device_count();
        let shared = Arc::new(Shared {
            directory,
            synchronizer,
            stats,
            queues: (0..device_count).map(|_| DeviceQueue::new()).collect(),
            completions: Mutex::new(Vec::new()),
            last_frame: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let distributor = Self {
            shared: shared.clone(),
            balancer,
            stalls: StallTracker::new(device_count, stall_threshold),
            next_command_buffer: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        };

        for index in 0..device_count {
            let device = DeviceIndex(index);
            let shared = shared.clone();
            // On error, dropping `distributor` stops the workers already started.
            let handle = std::thread::Builder::new()
                .name(format!("aero-multigpu-{device}"))
                .spawn(move || worker_loop(&shared, device))
                .map_err(|e| SubmitError::WorkerSpawn(e.to_string()))?;
            lock(&distributor.workers).push(handle);
        }
        debug!(devices = device_count, "command distributor started");
        Ok(distributor)
    }

    pub fn device_count(&self) -> u32 {
        self.shared.queues.len() as u32
    }

    fn queue(&self, device: DeviceIndex) -> Result<&DeviceQueue, SubmitError> {
        self.shared
            .queues
            .get(device.as_usize())
            .ok_or(SubmitError::InvalidDevice(device))
    }

    /// Start recording a command buffer bound to `device`.
    pub fn begin_command_buffer(&self, device: DeviceIndex) -> Result<CommandRecorder, SubmitError> {
        self.queue(device)?;
        let id = CommandBufferId(self.next_command_buffer.fetch_add(1, Ordering::Relaxed));
        Ok(CommandRecorder::new(id, device))
    }

    pub fn end_command_buffer(&self, recorder: CommandRecorder) -> CommandBuffer {
        recorder.finish()
    }

    /// Validate a submission and resolve its primitives without queueing it.
    fn prepare(&self, submission: GpuCommandSubmission) -> Result<(DeviceIndex, Job), SubmitError> {
        let device = submission.device;
        self.queue(device)?;
        for cb in &submission.command_buffers {
            if cb.device() != device {
                return Err(SubmitError::CommandBufferDeviceMismatch {
                    buffer: cb.id(),
                    expected: device,
                    actual: cb.device(),
                });
            }
        }

        let sync = &self.shared.synchronizer;
        let waits = submission
            .waits
            .iter()
            .map(|w| sync.resolve_wait(w))
            .collect::<Result<Vec<_>, _>>()?;
        let signals = submission
            .signals
            .iter()
            .map(|s| sync.resolve_signal(device, s))
            .collect::<Result<Vec<_>, _>>()?;
        let frame_id = submission.frame_id();

        Ok((
            device,
            Job {
                sequence: 0,
                frame_id,
                command_buffers: submission.command_buffers,
                waits,
                signals,
                fence: submission.completion_fence,
            },
        ))
    }

    fn enqueue(&self, device: DeviceIndex, mut job: Job) -> Result<u64, SubmitError> {
        let queue = self.queue(device)?;
        let mut state = lock(&queue.state);
        job.sequence = state.next_sequence;
        state.next_sequence += 1;
        let sequence = job.sequence;
        trace!(
            %device,
            sequence,
            frame_id = ?job.frame_id,
            buffers = job.command_buffers.len(),
            waits = job.waits.len(),
            signals = job.signals.len(),
            "queued submission"
        );
        if let Some(frame_id) = job.frame_id {
            self.shared.last_frame.fetch_max(frame_id, Ordering::SeqCst);
        }
        state.pending.push_back(job);
        drop(state);
        queue.cond.notify_all();
        self.shared.stats.inc_submissions();
        Ok(sequence)
    }

    /// Queue one device's submission. Returns its per-device sequence number.
    pub fn submit_command_buffers_to_gpu(
        &self,
        submission: GpuCommandSubmission,
    ) -> Result<u64, SubmitError> {
        let (device, job) = self.prepare(submission)?;
        self.enqueue(device, job)
    }

    /// Queue a batch of submissions. The whole batch is validated before anything is queued, so
    /// an error leaves every device queue untouched.
    pub fn submit_multi_gpu_frame(
        &self,
        submissions: Vec<GpuCommandSubmission>,
    ) -> Result<Vec<u64>, SubmitError> {
        let prepared = submissions
            .into_iter()
            .map(|s| self.prepare(s))
            .collect::<Result<Vec<_>, _>>()?;
        prepared
            .into_iter()
            .map(|(device, job)| self.enqueue(device, job))
            .collect()
    }

    /// Feed one workload estimate per device into the balancer. The resulting hint shapes the
    /// next frame opened on the Frame Distributor.
    pub fn balance_workload_across_gpus(
        &self,
        estimated_workloads: &[u32],
    ) -> Result<PartitionHint, SubmitError> {
        let expected = self.shared.queues.len();
        if estimated_workloads.len() != expected {
            return Err(SubmitError::WorkloadCount {
                expected,
                actual: estimated_workloads.len(),
            });
        }
        let hint = self.balancer.record_workloads(estimated_workloads);
        self.shared.stats.inc_rebalances();
        Ok(hint)
    }

    /// Wait until everything queued on `device` so far has finished.
    ///
    /// `Ok(false)` means the timeout elapsed. That is a recovery signal, not an error: the device
    /// keeps executing, and [`Self::recommend_recovery`] reflects the growing stall.
    pub fn wait_for_gpu_completion(
        &self,
        device: DeviceIndex,
        timeout: Duration,
    ) -> Result<bool, SubmitError> {
        let queue = self.queue(device)?;
        let target = lock(&queue.state).next_sequence - 1;
        let done = matches!(
            wait_on(&queue.state, &queue.cond, Some(timeout), |s| Ok(
                s.completed_sequence >= target
            )),
            Ok(true)
        );

        if done {
            self.stalls.record_completion(device);
        } else {
            self.shared.stats.inc_completion_timeouts();
            let streak = self.stalls.record_timeout(device).unwrap_or_default();
            warn!(%device, target, ?timeout, streak, "timed out waiting for device completion");
        }
        Ok(done)
    }

    /// Submissions queued on `device` that have not finished yet.
    pub fn pending_submissions(&self, device: DeviceIndex) -> Result<u64, SubmitError> {
        let state = lock(&self.queue(device)?.state);
        Ok(state.next_sequence - 1 - state.completed_sequence)
    }

    /// Take every completion recorded since the last call, in completion order.
    pub fn drain_completions(&self) -> Vec<SubmissionCompletion> {
        std::mem::take(&mut *lock(&self.shared.completions))
    }

    /// Per-device execution time of the most recently queued frame.
    ///
    /// Devices that took no part in that frame, or have not finished it yet, report zero.
    pub fn last_frame_device_times(&self) -> Vec<Duration> {
        let last_frame = self.shared.last_frame.load(Ordering::SeqCst);
        self.shared
            .queues
            .iter()
            .map(|q| match lock(&q.state).frame_busy {
                Some((frame_id, busy)) if frame_id == last_frame => busy,
                _ => Duration::ZERO,
            })
            .collect()
    }

    pub fn device_health(&self, device: DeviceIndex) -> Option<DeviceHealth> {
        self.stalls.health(device)
    }

    pub fn recommend_recovery(&self, device: DeviceIndex) -> Option<RecoveryAction> {
        self.stalls.recommend(device)
    }
}

impl Drop for CommandDistributor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        for queue in &self.shared.queues {
            // Take the lock so a worker between its shutdown check and `wait` sees the notify.
            drop(lock(&queue.state));
            queue.cond.notify_all();
        }
        for handle in lock(&self.workers).drain(..) {
            if handle.join().is_err() {
                error!("device worker panicked");
            }
        }
    }
}

fn worker_loop(shared: &Shared, device: DeviceIndex) {
    let Some(queue) = shared.queues.get(device.as_usize()) else {
        return;
    };
    loop {
        let job = {
            let mut state = lock(&queue.state);
            loop {
                if let Some(job) = state.pending.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    trace!(%device, "device worker exiting");
                    return;
                }
                state = queue
                    .cond
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };
        run_job(shared, queue, device, job);
    }
}

fn wait_until_ready(shared: &Shared, wait: &ResolvedWait) -> Result<(), String> {
    loop {
        match wait.wait(Some(WAIT_POLL_INTERVAL)) {
            Ok(true) => return Ok(()),
            Ok(false) if shared.shutdown.load(Ordering::SeqCst) => {
                return Err("shut down before wait was satisfied".into())
            }
            Ok(false) => {}
            Err(e) => return Err(format!("wait failed: {e}")),
        }
    }
}

fn run_job(shared: &Shared, queue: &DeviceQueue, device: DeviceIndex, job: Job) {
    let mut failure: Option<String> = None;
    for wait in &job.waits {
        if let Err(e) = wait_until_ready(shared, wait) {
            failure = Some(e);
            break;
        }
    }

    let started = Instant::now();
    if failure.is_none() {
        for cb in &job.command_buffers {
            if let Err(e) = shared.directory.execute_command_buffer(device, cb) {
                failure = Some(e.to_string());
                break;
            }
        }
    }
    let busy = started.elapsed();

    for signal in &job.signals {
        if let Err(e) = shared.synchronizer.fire(signal) {
            warn!(%device, sequence = job.sequence, %e, "failed to fire signal");
            failure.get_or_insert_with(|| format!("signal failed: {e}"));
        }
    }
    if let Some(fence) = &job.fence {
        fence.signal();
    }

    if let Some(reason) = &failure {
        shared.stats.inc_submission_failures();
        warn!(%device, sequence = job.sequence, frame_id = ?job.frame_id, %reason, "submission failed");
    } else {
        trace!(%device, sequence = job.sequence, ?busy, "submission complete");
    }

    // Record the completion before publishing the sequence so a waiter that wakes on the sequence
    // always finds it in `drain_completions`.
    lock(&shared.completions).push(SubmissionCompletion {
        device,
        sequence: job.sequence,
        frame_id: job.frame_id,
        busy,
        error: failure,
    });

    let mut state = lock(&queue.state);
    state.completed_sequence = job.sequence;
    if let Some(frame_id) = job.frame_id {
        state.frame_busy = match state.frame_busy {
            Some((current, total)) if current == frame_id => Some((frame_id, total + busy)),
            _ => Some((frame_id, busy)),
        };
    }
    drop(state);
    queue.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameRegion, PipelineStages, SoftDeviceDirectory};
    use pretty_assertions::assert_eq;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        soft: Arc<SoftDeviceDirectory>,
        sync: Arc<MultiGpuSynchronizer>,
        commands: CommandDistributor,
    }

    fn harness(devices: u32) -> Harness {
        let soft = Arc::new(SoftDeviceDirectory::with_devices(devices));
        let stats = Arc::new(MultiGpuStats::new());
        let sync = Arc::new(MultiGpuSynchronizer::new(soft.as_ref(), stats.clone()));
        let commands = CommandDistributor::new(
            soft.clone(),
            sync.clone(),
            Arc::new(WorkloadBalancer::new(1.0)),
            stats,
            2,
        )
        .unwrap();
        Harness {
            soft,
            sync,
            commands,
        }
    }

    fn buffer(commands: &CommandDistributor, device: u32, label: &str) -> CommandBuffer {
        let mut rec = commands.begin_command_buffer(DeviceIndex(device)).unwrap();
        rec.marker(label)
            .draw(FrameRegion::new(0, 0, 1, 1, DeviceIndex(device)), 1);
        commands.end_command_buffer(rec)
    }

    #[test]
    fn submission_runs_and_signals_fence() {
        let h = harness(2);
        let fence = CompletionFence::new();
        let sub = GpuCommandSubmission::new(DeviceIndex(1), vec![buffer(&h.commands, 1, "a")])
            .with_fence(fence.clone());

        assert_eq!(h.commands.submit_command_buffers_to_gpu(sub).unwrap(), 1);
        assert!(fence.wait(TIMEOUT));
        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(1), TIMEOUT).unwrap());
        assert_eq!(h.commands.pending_submissions(DeviceIndex(1)).unwrap(), 0);

        let completions = h.commands.drain_completions();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].device, DeviceIndex(1));
        assert_eq!(completions[0].error, None);
        assert_eq!(h.soft.execution_log()[0].labels, vec!["a".to_string()]);
    }

    #[test]
    fn buffer_for_another_device_is_rejected() {
        let h = harness(2);
        let cb = buffer(&h.commands, 0, "wrong");
        let id = cb.id();
        let err = h
            .commands
            .submit_command_buffers_to_gpu(GpuCommandSubmission::new(DeviceIndex(1), vec![cb]))
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::CommandBufferDeviceMismatch {
                buffer: id,
                expected: DeviceIndex(1),
                actual: DeviceIndex(0)
            }
        );
    }

    #[test]
    fn invalid_batch_queues_nothing() {
        let h = harness(2);
        let good = GpuCommandSubmission::new(DeviceIndex(0), vec![buffer(&h.commands, 0, "ok")]);
        let bad = GpuCommandSubmission::new(DeviceIndex(5), Vec::new());
        assert_eq!(
            h.commands.submit_multi_gpu_frame(vec![good, bad]),
            Err(SubmitError::InvalidDevice(DeviceIndex(5)))
        );
        assert_eq!(h.commands.pending_submissions(DeviceIndex(0)).unwrap(), 0);
        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(0), TIMEOUT).unwrap());
        assert!(h.soft.execution_log().is_empty());
    }

    #[test]
    fn submissions_on_one_device_run_in_order() {
        let h = harness(1);
        for label in ["first", "second", "third"] {
            h.commands
                .submit_command_buffers_to_gpu(GpuCommandSubmission::new(
                    DeviceIndex(0),
                    vec![buffer(&h.commands, 0, label)],
                ))
                .unwrap();
        }
        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(0), TIMEOUT).unwrap());
        let labels: Vec<String> = h
            .soft
            .execution_log()
            .into_iter()
            .flat_map(|r| r.labels)
            .collect();
        assert_eq!(labels, vec!["first", "second", "third"]);
    }

    #[test]
    fn failed_execution_still_signals_and_is_not_retried() {
        let h = harness(2);
        h.soft.set_fail_execution(DeviceIndex(0), true);
        let event = h.sync.create_cross_gpu_event(DeviceIndex(0)).unwrap();
        let fence = CompletionFence::new();
        let sub = GpuCommandSubmission::new(DeviceIndex(0), vec![buffer(&h.commands, 0, "boom")])
            .with_signals(vec![SignalPrimitive::Event { event }])
            .with_fence(fence.clone());
        h.commands.submit_command_buffers_to_gpu(sub).unwrap();

        assert!(fence.wait(TIMEOUT));
        assert_eq!(h.sync.event_status(event), Ok(true));
        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(0), TIMEOUT).unwrap());
        let completions = h.commands.drain_completions();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].error.as_deref().unwrap().contains("injected"));
        assert!(h.soft.execution_log().is_empty());
    }

    #[test]
    fn timeout_feeds_stall_tracking() {
        let h = harness(2);
        let gate = h.sync.create_timeline_semaphore(DeviceIndex(0), 0).unwrap();
        let sub = GpuCommandSubmission::new(DeviceIndex(1), vec![buffer(&h.commands, 1, "gated")])
            .with_waits(vec![WaitPrimitive::Timeline {
                timeline: gate,
                value: 1,
                stage: PipelineStages::ALL_COMMANDS,
            }]);
        h.commands.submit_command_buffers_to_gpu(sub).unwrap();

        let d = DeviceIndex(1);
        assert!(!h.commands.wait_for_gpu_completion(d, Duration::from_millis(20)).unwrap());
        assert_eq!(h.commands.recommend_recovery(d), Some(RecoveryAction::SkipRegion));
        assert!(!h.commands.wait_for_gpu_completion(d, Duration::from_millis(20)).unwrap());
        assert_eq!(
            h.commands.recommend_recovery(d),
            Some(RecoveryAction::FallBackToSingleDevice)
        );

        h.sync.signal_timeline(gate, 1).unwrap();
        assert!(h.commands.wait_for_gpu_completion(d, TIMEOUT).unwrap());
        assert_eq!(h.commands.device_health(d), Some(DeviceHealth::Healthy));
        assert_eq!(h.soft.execution_log().len(), 1);
    }

    #[test]
    fn destroyed_wait_target_fails_submission_without_blocking() {
        let h = harness(2);
        let gate = h.sync.create_timeline_semaphore(DeviceIndex(0), 0).unwrap();
        let sub = GpuCommandSubmission::new(DeviceIndex(1), vec![buffer(&h.commands, 1, "x")])
            .with_waits(vec![WaitPrimitive::Timeline {
                timeline: gate,
                value: 1,
                stage: PipelineStages::ALL_COMMANDS,
            }]);
        h.commands.submit_command_buffers_to_gpu(sub).unwrap();
        h.sync.destroy_timeline_semaphore(DeviceIndex(0), gate).unwrap();

        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(1), TIMEOUT).unwrap());
        let completions = h.commands.drain_completions();
        assert!(completions[0].error.as_deref().unwrap().contains("destroyed"));
    }

    #[test]
    fn unbounded_timeouts_do_not_overflow() {
        let h = harness(1);
        let fence = CompletionFence::new();
        let sub = GpuCommandSubmission::new(DeviceIndex(0), vec![buffer(&h.commands, 0, "a")])
            .with_fence(fence.clone());
        h.commands.submit_command_buffers_to_gpu(sub).unwrap();
        assert!(h.commands.wait_for_gpu_completion(DeviceIndex(0), Duration::MAX).unwrap());
        assert!(fence.wait(Duration::MAX));
    }

    #[test]
    fn workload_count_must_match_devices() {
        let h = harness(3);
        assert_eq!(
            h.commands.balance_workload_across_gpus(&[1, 2]),
            Err(SubmitError::WorkloadCount {
                expected: 3,
                actual: 2
            })
        );
        let hint = h.commands.balance_workload_across_gpus(&[100, 100, 200]).unwrap();
        assert_eq!(hint.weights(), &[4000, 4000, 2000]);
    }

    #[test]
    fn begin_command_buffer_rejects_inactive_device() {
        let h = harness(1);
        assert!(matches!(
            h.commands.begin_command_buffer(DeviceIndex(1)),
            Err(SubmitError::InvalidDevice(DeviceIndex(1)))
        ));
    }
}
