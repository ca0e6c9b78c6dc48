//! Cross-Device Synchronizer.
//!
//! Owns every synchronization object the multi-GPU core uses:
//! - one frame completion counter per device, advanced only by signals;
//! - timeline primitives (monotonic counters) created on behalf of callers;
//! - one-shot events;
//! - one internal barrier timeline per device, used to express inter-device barriers.
//!
//! Barriers are not executed directly. [`MultiGpuSynchronizer::insert_barrier`] queues a signal
//! on the producer and a matching wait on the consumer; the next submission built for each device
//! picks them up through [`MultiGpuSynchronizer::take_pending_primitives`].
//!
//! Every entry point validates device indices and handles before touching shared state, so a bad
//! call fails with a [`SyncError`] and leaves every other primitive intact.

mod event;
mod timeline;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{DeviceDirectory, DeviceIndex, MultiGpuStats};

use event::Event;
use timeline::Timeline;

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this crate is a short field update, so the protected state is
/// structurally valid even after a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Block on `cond` until `ready` reports true, fails, or `timeout` elapses.
///
/// A timeout too large to represent as a deadline waits without one.
pub(crate) fn wait_on<T>(
    mutex: &Mutex<T>,
    cond: &Condvar,
    timeout: Option<Duration>,
    mut ready: impl FnMut(&T) -> Result<bool, SyncError>,
) -> Result<bool, SyncError> {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let mut guard = lock(mutex);
    loop {
        if ready(&guard)? {
            return Ok(true);
        }
        match deadline {
            None => {
                guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(false);
                }
                guard = cond
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
}

bitflags! {
    /// Pipeline stages a barrier is scoped to. Bit values follow the Vulkan stage flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 7;
        const EARLY_FRAGMENT_TESTS = 1 << 8;
        const LATE_FRAGMENT_TESTS = 1 << 9;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 10;
        const COMPUTE_SHADER = 1 << 11;
        const TRANSFER = 1 << 12;
        const BOTTOM_OF_PIPE = 1 << 13;
        const ALL_COMMANDS = 1 << 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineHandle {
    device: DeviceIndex,
    id: u64,
}

impl TimelineHandle {
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    device: DeviceIndex,
    id: u64,
}

impl EventHandle {
    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Must be satisfied before a submission starts executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPrimitive {
    Timeline {
        timeline: TimelineHandle,
        value: u64,
        stage: PipelineStages,
    },
    Event {
        event: EventHandle,
        stage: PipelineStages,
    },
}

/// Fired once a submission finishes executing. Always scoped to the submitting device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPrimitive {
    Timeline { timeline: TimelineHandle, value: u64 },
    Event { event: EventHandle },
    FrameComplete { frame_id: u64 },
}

/// Barrier primitives queued for a device's next submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingPrimitives {
    pub waits: Vec<WaitPrimitive>,
    pub signals: Vec<SignalPrimitive>,
}

impl PendingPrimitives {
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty() && self.signals.is_empty()
    }
}

/// Producer/consumer ordering established by [`MultiGpuSynchronizer::insert_barrier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterGpuBarrier {
    pub src_device: DeviceIndex,
    pub dst_device: DeviceIndex,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    /// Producer's barrier timeline and the value that releases the consumer.
    pub timeline: TimelineHandle,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("device {0} is not active")]
    InvalidDevice(DeviceIndex),

    #[error("unknown timeline {0:?}")]
    UnknownTimeline(TimelineHandle),

    #[error("unknown event {0:?}")]
    UnknownEvent(EventHandle),

    #[error("primitive owned by {primitive} used on {device}")]
    DeviceMismatch {
        device: DeviceIndex,
        primitive: DeviceIndex,
    },

    #[error("non-monotonic signal: current value {current}, requested {requested}")]
    NonMonotonicSignal { current: u64, requested: u64 },

    #[error("synchronization primitive was destroyed")]
    Destroyed,

    #[error("barrier source and destination are both {0}")]
    SameDeviceBarrier(DeviceIndex),

    #[error("timeline {0:?} is reserved for inter-device barriers")]
    Reserved(TimelineHandle),

    #[error("barrier {src} -> {dst} would close a cycle with barriers still pending")]
    CyclicBarrier { src: DeviceIndex, dst: DeviceIndex },
}

/// A wait primitive resolved to the object it blocks on.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedWait {
    Timeline { timeline: Arc<Timeline>, value: u64 },
    Event(Arc<Event>),
}

impl ResolvedWait {
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        match self {
            ResolvedWait::Timeline { timeline, value } => timeline.wait(*value, timeout),
            ResolvedWait::Event(event) => event.wait(timeout),
        }
    }
}

/// A signal primitive resolved to the object it advances.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedSignal {
    Timeline {
        handle: TimelineHandle,
        timeline: Arc<Timeline>,
        value: u64,
    },
    Event {
        handle: EventHandle,
        event: Arc<Event>,
    },
    FrameComplete {
        device: DeviceIndex,
        counter: Arc<Timeline>,
        frame_id: u64,
    },
}

#[derive(Debug)]
struct BarrierQueue {
    pending: PendingPrimitives,
    next_value: u64,
}

#[derive(Debug)]
struct DeviceSync {
    frame_counter: Arc<Timeline>,
    barrier_timeline: TimelineHandle,
    barriers: Mutex<BarrierQueue>,
}

/// A barrier whose primitives have not all been taken by a submission yet.
#[derive(Debug)]
struct BarrierEdge {
    src: DeviceIndex,
    dst: DeviceIndex,
    signal_taken: bool,
    wait_taken: bool,
}

/// True if `to` is reachable from `from` along pending barrier edges.
fn reachable(edges: &[BarrierEdge], from: DeviceIndex, to: DeviceIndex) -> bool {
    let mut stack = vec![from];
    let mut seen = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        for edge in edges.iter().filter(|e| e.src == node) {
            if !seen.contains(&edge.dst) {
                seen.push(edge.dst);
                stack.push(edge.dst);
            }
        }
    }
    false
}

#[derive(Debug)]
pub struct MultiGpuSynchronizer {
    devices: Vec<DeviceSync>,
    /// Lock order: `edges` before any per-device `barriers` queue.
    edges: Mutex<Vec<BarrierEdge>>,
    timelines: RwLock<HashMap<TimelineHandle, Arc<Timeline>>>,
    events: RwLock<HashMap<EventHandle, Arc<Event>>>,
    next_id: AtomicU64,
    stats: Arc<MultiGpuStats>,
}

impl MultiGpuSynchronizer {
    pub fn new(directory: &dyn DeviceDirectory, stats: Arc<MultiGpuStats>) -> Self {
        let next_id = AtomicU64::new(1);
        let mut timelines = HashMap::new();
        let devices = (0..directory.active_device_count())
            .map(|i| {
                let barrier_timeline = TimelineHandle {
                    device: DeviceIndex(i),
                    id: next_id.fetch_add(1, Ordering::Relaxed),
                };
                timelines.insert(barrier_timeline, Arc::new(Timeline::new(0)));
                DeviceSync {
                    frame_counter: Arc::new(Timeline::new(0)),
                    barrier_timeline,
                    barriers: Mutex::new(BarrierQueue {
                        pending: PendingPrimitives::default(),
                        next_value: 1,
                    }),
                }
            })
            .collect();

        Self {
            devices,
            edges: Mutex::new(Vec::new()),
            timelines: RwLock::new(timelines),
            events: RwLock::new(HashMap::new()),
            next_id,
            stats,
        }
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    fn device(&self, device: DeviceIndex) -> Result<&DeviceSync, SyncError> {
        self.devices
            .get(device.as_usize())
            .ok_or(SyncError::InvalidDevice(device))
    }

    fn timeline(&self, handle: TimelineHandle) -> Result<Arc<Timeline>, SyncError> {
        self.timelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or(SyncError::UnknownTimeline(handle))
    }

    fn event(&self, handle: EventHandle) -> Result<Arc<Event>, SyncError> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
            .ok_or(SyncError::UnknownEvent(handle))
    }

    fn is_reserved(&self, handle: TimelineHandle) -> bool {
        self.devices
            .get(handle.device.as_usize())
            .is_some_and(|d| d.barrier_timeline == handle)
    }

    // Timelines.

    pub fn create_timeline_semaphore(
        &self,
        device: DeviceIndex,
        initial_value: u64,
    ) -> Result<TimelineHandle, SyncError> {
        self.device(device)?;
        let handle = TimelineHandle {
            device,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.timelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(Timeline::new(initial_value)));
        trace!(%device, id = handle.id, initial_value, "created timeline");
        Ok(handle)
    }

    /// Release a timeline. Waiters blocked on it wake with [`SyncError::Destroyed`].
    pub fn destroy_timeline_semaphore(
        &self,
        device: DeviceIndex,
        handle: TimelineHandle,
    ) -> Result<(), SyncError> {
        self.device(device)?;
        if handle.device != device {
            return Err(SyncError::DeviceMismatch {
                device,
                primitive: handle.device,
            });
        }
        if self.is_reserved(handle) {
            return Err(SyncError::Reserved(handle));
        }
        let timeline = self
            .timelines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(SyncError::UnknownTimeline(handle))?;
        timeline.destroy();
        trace!(%device, id = handle.id, "destroyed timeline");
        Ok(())
    }

    /// Host-side signal. `value` must not be below the current value; signaling the current value
    /// again is a no-op.
    pub fn signal_timeline(&self, handle: TimelineHandle, value: u64) -> Result<(), SyncError> {
        self.timeline(handle)?.signal(value).map(|_| ())
    }

    pub fn timeline_value(&self, handle: TimelineHandle) -> Result<u64, SyncError> {
        self.timeline(handle)?.value()
    }

    /// Returns `Ok(false)` if `timeout` elapsed before the timeline reached `value`.
    pub fn wait_timeline(
        &self,
        handle: TimelineHandle,
        value: u64,
        timeout: Option<Duration>,
    ) -> Result<bool, SyncError> {
        self.timeline(handle)?.wait(value, timeout)
    }

    // Frame completion counters.

    /// Record that `device` finished `frame_id`. Signaling a lower id than already recorded is
    /// rejected; signaling the same id again is a no-op.
    pub fn signal_frame_complete(&self, device: DeviceIndex, frame_id: u64) -> Result<(), SyncError> {
        let advanced = self.device(device)?.frame_counter.signal(frame_id)?;
        if advanced {
            trace!(%device, frame_id, "frame complete");
        }
        Ok(())
    }

    pub fn frame_completion_counter(&self, device: DeviceIndex) -> Result<u64, SyncError> {
        self.device(device)?.frame_counter.value()
    }

    /// Block until `device` has finished `frame_id`. Returns immediately if it already has.
    pub fn wait_for_frame_complete(&self, device: DeviceIndex, frame_id: u64) -> Result<(), SyncError> {
        self.device(device)?
            .frame_counter
            .wait(frame_id, None)
            .map(|_| ())
    }

    pub fn wait_for_frame_complete_timeout(
        &self,
        device: DeviceIndex,
        frame_id: u64,
        timeout: Duration,
    ) -> Result<bool, SyncError> {
        self.device(device)?.frame_counter.wait(frame_id, Some(timeout))
    }

    // Events.

    pub fn create_cross_gpu_event(&self, device: DeviceIndex) -> Result<EventHandle, SyncError> {
        self.device(device)?;
        let handle = EventHandle {
            device,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, Arc::new(Event::new()));
        Ok(handle)
    }

    pub fn destroy_event(&self, handle: EventHandle) -> Result<(), SyncError> {
        let event = self
            .events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .ok_or(SyncError::UnknownEvent(handle))?;
        event.destroy();
        Ok(())
    }

    pub fn signal_event(&self, handle: EventHandle) -> Result<(), SyncError> {
        let event = self.event(handle)?;
        self.signal_event_object(handle, &event)
    }

    fn signal_event_object(&self, handle: EventHandle, event: &Event) -> Result<(), SyncError> {
        if event.signal()? {
            self.stats.inc_events_signaled();
        } else {
            warn!(device = %handle.device, id = handle.id, "event already signaled; reset it before reuse");
        }
        Ok(())
    }

    pub fn reset_event(&self, handle: EventHandle) -> Result<(), SyncError> {
        self.event(handle)?.reset()
    }

    pub fn event_status(&self, handle: EventHandle) -> Result<bool, SyncError> {
        self.event(handle)?.is_signaled()
    }

    pub fn wait_for_event(&self, handle: EventHandle) -> Result<(), SyncError> {
        self.event(handle)?.wait(None).map(|_| ())
    }

    pub fn wait_for_event_timeout(
        &self,
        handle: EventHandle,
        timeout: Duration,
    ) -> Result<bool, SyncError> {
        self.event(handle)?.wait(Some(timeout))
    }

    // Barriers.

    /// Order `dst_stage` work on `dst` after `src_stage` work on `src`.
    ///
    /// The producer's next submission signals its barrier timeline; the consumer's next
    /// submission waits on that value before it starts. A barrier that would make those
    /// submissions wait on each other, directly or through other pending barriers, is rejected
    /// with [`SyncError::CyclicBarrier`].
    pub fn insert_barrier(
        &self,
        src: DeviceIndex,
        dst: DeviceIndex,
        src_stage: PipelineStages,
        dst_stage: PipelineStages,
    ) -> Result<InterGpuBarrier, SyncError> {
        let producer = self.device(src)?;
        let consumer = self.device(dst)?;
        if src == dst {
            return Err(SyncError::SameDeviceBarrier(src));
        }

        let mut edges = lock(&self.edges);
        if reachable(&edges, dst, src) {
            warn!(%src, %dst, "rejected cyclic inter-gpu barrier");
            return Err(SyncError::CyclicBarrier { src, dst });
        }
        edges.push(BarrierEdge {
            src,
            dst,
            signal_taken: false,
            wait_taken: false,
        });

        let timeline = producer.barrier_timeline;
        let value = {
            let mut queue = lock(&producer.barriers);
            let value = queue.next_value;
            queue.next_value += 1;
            queue
                .pending
                .signals
                .push(SignalPrimitive::Timeline { timeline, value });
            value
        };
        lock(&consumer.barriers)
            .pending
            .waits
            .push(WaitPrimitive::Timeline {
                timeline,
                value,
                stage: dst_stage,
            });
        drop(edges);

        self.stats.inc_barriers_inserted();
        debug!(%src, %dst, ?src_stage, ?dst_stage, value, "inserted inter-gpu barrier");
        Ok(InterGpuBarrier {
            src_device: src,
            dst_device: dst,
            src_stage,
            dst_stage,
            timeline,
            value,
        })
    }

    /// Take the barrier primitives queued for `device`, leaving its queue empty.
    pub fn take_pending_primitives(&self, device: DeviceIndex) -> Result<PendingPrimitives, SyncError> {
        let sync = self.device(device)?;
        let mut edges = lock(&self.edges);
        let pending = std::mem::take(&mut lock(&sync.barriers).pending);
        for edge in edges.iter_mut() {
            if edge.src == device {
                edge.signal_taken = true;
            }
            if edge.dst == device {
                edge.wait_taken = true;
            }
        }
        edges.retain(|e| !(e.signal_taken && e.wait_taken));
        Ok(pending)
    }

    /// Barrier timeline owned by `device`.
    pub fn barrier_timeline(&self, device: DeviceIndex) -> Result<TimelineHandle, SyncError> {
        Ok(self.device(device)?.barrier_timeline)
    }

    // Submission plumbing.

    pub(crate) fn resolve_wait(&self, wait: &WaitPrimitive) -> Result<ResolvedWait, SyncError> {
        match *wait {
            WaitPrimitive::Timeline {
                timeline, value, ..
            } => Ok(ResolvedWait::Timeline {
                timeline: self.timeline(timeline)?,
                value,
            }),
            WaitPrimitive::Event { event, .. } => Ok(ResolvedWait::Event(self.event(event)?)),
        }
    }

    pub(crate) fn resolve_signal(
        &self,
        device: DeviceIndex,
        signal: &SignalPrimitive,
    ) -> Result<ResolvedSignal, SyncError> {
        let owned_by = |primitive: DeviceIndex| {
            if primitive == device {
                Ok(())
            } else {
                Err(SyncError::DeviceMismatch { device, primitive })
            }
        };
        match *signal {
            SignalPrimitive::Timeline { timeline, value } => {
                owned_by(timeline.device)?;
                Ok(ResolvedSignal::Timeline {
                    handle: timeline,
                    timeline: self.timeline(timeline)?,
                    value,
                })
            }
            SignalPrimitive::Event { event } => {
                owned_by(event.device)?;
                Ok(ResolvedSignal::Event {
                    handle: event,
                    event: self.event(event)?,
                })
            }
            SignalPrimitive::FrameComplete { frame_id } => Ok(ResolvedSignal::FrameComplete {
                device,
                counter: self.device(device)?.frame_counter.clone(),
                frame_id,
            }),
        }
    }

    pub(crate) fn fire(&self, signal: &ResolvedSignal) -> Result<(), SyncError> {
        match signal {
            ResolvedSignal::Timeline {
                handle,
                timeline,
                value,
            } => {
                timeline.signal(*value)?;
                trace!(device = %handle.device, id = handle.id, value, "timeline signaled");
                Ok(())
            }
            ResolvedSignal::Event { handle, event } => self.signal_event_object(*handle, event),
            ResolvedSignal::FrameComplete {
                device,
                counter,
                frame_id,
            } => {
                if counter.signal(*frame_id)? {
                    trace!(%device, frame_id, "frame complete");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SoftDeviceDirectory;
    use std::thread;

    fn synchronizer(devices: u32) -> Arc<MultiGpuSynchronizer> {
        let dir = SoftDeviceDirectory::with_devices(devices);
        Arc::new(MultiGpuSynchronizer::new(&dir, Arc::new(MultiGpuStats::new())))
    }

    #[test]
    fn out_of_range_device_fails_cleanly() {
        let sync = synchronizer(2);
        let bad = DeviceIndex(2);
        assert_eq!(sync.create_timeline_semaphore(bad, 0), Err(SyncError::InvalidDevice(bad)));
        assert_eq!(sync.create_cross_gpu_event(bad), Err(SyncError::InvalidDevice(bad)));
        assert_eq!(sync.signal_frame_complete(bad, 1), Err(SyncError::InvalidDevice(bad)));
        assert_eq!(sync.wait_for_frame_complete(bad, 1), Err(SyncError::InvalidDevice(bad)));
        assert_eq!(sync.frame_completion_counter(DeviceIndex(0)), Ok(0));
    }

    #[test]
    fn frame_counter_rejects_regression() {
        let sync = synchronizer(1);
        let d = DeviceIndex(0);
        sync.signal_frame_complete(d, 4).unwrap();
        sync.signal_frame_complete(d, 4).unwrap();
        assert_eq!(
            sync.signal_frame_complete(d, 3),
            Err(SyncError::NonMonotonicSignal {
                current: 4,
                requested: 3
            })
        );
        assert_eq!(sync.frame_completion_counter(d), Ok(4));
        sync.wait_for_frame_complete(d, 2).unwrap();
    }

    #[test]
    fn frame_counter_is_monotonic_under_concurrent_signals() {
        let sync = synchronizer(1);
        let d = DeviceIndex(0);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let observer = {
            let sync = sync.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut last = 0;
                while !stop.load(Ordering::Relaxed) {
                    let now = sync.frame_completion_counter(d).unwrap();
                    assert!(now >= last, "counter went backwards: {last} -> {now}");
                    last = now;
                }
            })
        };

        let signalers: Vec<_> = (0..4u64)
            .map(|t| {
                let sync = sync.clone();
                thread::spawn(move || {
                    for i in 0..500u64 {
                        // Out-of-order ids are rejected; the counter must never regress.
                        let _ = sync.signal_frame_complete(d, i * 4 + t);
                    }
                })
            })
            .collect();
        for s in signalers {
            s.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        observer.join().unwrap();
        assert!(sync.frame_completion_counter(d).unwrap() >= 499 * 4);
    }

    #[test]
    fn concurrent_waiters_all_release() {
        let sync = synchronizer(2);
        let d = DeviceIndex(1);
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let sync = sync.clone();
                thread::spawn(move || sync.wait_for_frame_complete(d, 3))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        sync.signal_frame_complete(d, 3).unwrap();
        for w in waiters {
            assert_eq!(w.join().unwrap(), Ok(()));
        }
    }

    #[test]
    fn double_destroy_is_an_error_not_a_corruption() {
        let sync = synchronizer(2);
        let d = DeviceIndex(0);
        let a = sync.create_timeline_semaphore(d, 0).unwrap();
        let b = sync.create_timeline_semaphore(d, 7).unwrap();

        sync.destroy_timeline_semaphore(d, a).unwrap();
        assert_eq!(sync.destroy_timeline_semaphore(d, a), Err(SyncError::UnknownTimeline(a)));
        assert_eq!(sync.signal_timeline(a, 1), Err(SyncError::UnknownTimeline(a)));
        assert_eq!(sync.timeline_value(b), Ok(7));
    }

    #[test]
    fn destroy_checks_owner_and_reserved_timelines() {
        let sync = synchronizer(2);
        let tl = sync.create_timeline_semaphore(DeviceIndex(1), 0).unwrap();
        assert_eq!(
            sync.destroy_timeline_semaphore(DeviceIndex(0), tl),
            Err(SyncError::DeviceMismatch {
                device: DeviceIndex(0),
                primitive: DeviceIndex(1)
            })
        );
        let reserved = sync.barrier_timeline(DeviceIndex(0)).unwrap();
        assert_eq!(
            sync.destroy_timeline_semaphore(DeviceIndex(0), reserved),
            Err(SyncError::Reserved(reserved))
        );
    }

    #[test]
    fn timeline_wait_with_timeout() {
        let sync = synchronizer(1);
        let tl = sync.create_timeline_semaphore(DeviceIndex(0), 1).unwrap();
        assert_eq!(sync.wait_timeline(tl, 2, Some(Duration::from_millis(5))), Ok(false));
        sync.signal_timeline(tl, 2).unwrap();
        assert_eq!(sync.wait_timeline(tl, 2, Some(Duration::from_millis(5))), Ok(true));
    }

    #[test]
    fn event_signal_and_reset() {
        let sync = synchronizer(2);
        let ev = sync.create_cross_gpu_event(DeviceIndex(1)).unwrap();
        assert_eq!(sync.event_status(ev), Ok(false));
        sync.signal_event(ev).unwrap();
        sync.signal_event(ev).unwrap();
        assert_eq!(sync.event_status(ev), Ok(true));
        sync.wait_for_event(ev).unwrap();
        sync.reset_event(ev).unwrap();
        assert_eq!(sync.wait_for_event_timeout(ev, Duration::from_millis(2)), Ok(false));
        sync.destroy_event(ev).unwrap();
        assert_eq!(sync.event_status(ev), Err(SyncError::UnknownEvent(ev)));
    }

    #[test]
    fn barrier_queues_signal_on_producer_and_wait_on_consumer() {
        let sync = synchronizer(3);
        let barrier = sync
            .insert_barrier(
                DeviceIndex(0),
                DeviceIndex(2),
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                PipelineStages::FRAGMENT_SHADER,
            )
            .unwrap();
        assert_eq!(barrier.value, 1);
        assert_eq!(barrier.timeline.device(), DeviceIndex(0));

        let producer = sync.take_pending_primitives(DeviceIndex(0)).unwrap();
        assert_eq!(
            producer.signals,
            vec![SignalPrimitive::Timeline {
                timeline: barrier.timeline,
                value: 1
            }]
        );
        assert!(producer.waits.is_empty());

        let consumer = sync.take_pending_primitives(DeviceIndex(2)).unwrap();
        assert_eq!(
            consumer.waits,
            vec![WaitPrimitive::Timeline {
                timeline: barrier.timeline,
                value: 1,
                stage: PipelineStages::FRAGMENT_SHADER
            }]
        );
        assert!(sync.take_pending_primitives(DeviceIndex(1)).unwrap().is_empty());
        assert!(sync.take_pending_primitives(DeviceIndex(2)).unwrap().is_empty());
    }

    fn barrier(sync: &MultiGpuSynchronizer, src: u32, dst: u32) -> Result<InterGpuBarrier, SyncError> {
        sync.insert_barrier(
            DeviceIndex(src),
            DeviceIndex(dst),
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            PipelineStages::FRAGMENT_SHADER,
        )
    }

    #[test]
    fn opposite_barriers_in_one_frame_are_rejected() {
        let sync = synchronizer(3);
        barrier(&sync, 0, 1).unwrap();
        assert_eq!(
            barrier(&sync, 1, 0),
            Err(SyncError::CyclicBarrier {
                src: DeviceIndex(1),
                dst: DeviceIndex(0)
            })
        );

        barrier(&sync, 1, 2).unwrap();
        assert_eq!(
            barrier(&sync, 2, 0),
            Err(SyncError::CyclicBarrier {
                src: DeviceIndex(2),
                dst: DeviceIndex(0)
            })
        );
        // The rejected barriers queued nothing.
        assert!(sync.take_pending_primitives(DeviceIndex(0)).unwrap().waits.is_empty());
    }

    #[test]
    fn reverse_barrier_is_allowed_once_both_sides_are_taken() {
        let sync = synchronizer(2);
        barrier(&sync, 0, 1).unwrap();

        // Only the producer has submitted; the consumer's wait is still pending.
        sync.take_pending_primitives(DeviceIndex(0)).unwrap();
        assert!(matches!(barrier(&sync, 1, 0), Err(SyncError::CyclicBarrier { .. })));

        sync.take_pending_primitives(DeviceIndex(1)).unwrap();
        barrier(&sync, 1, 0).unwrap();
    }

    #[test]
    fn huge_timeouts_wait_without_a_deadline() {
        let sync = synchronizer(1);
        let tl = sync.create_timeline_semaphore(DeviceIndex(0), 3).unwrap();
        assert_eq!(sync.wait_timeline(tl, 3, Some(Duration::MAX)), Ok(true));

        let ev = sync.create_cross_gpu_event(DeviceIndex(0)).unwrap();
        let waiter = {
            let sync = sync.clone();
            thread::spawn(move || sync.wait_for_event_timeout(ev, Duration::MAX))
        };
        thread::sleep(Duration::from_millis(10));
        sync.signal_event(ev).unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }

    #[test]
    fn same_device_barrier_is_rejected() {
        let sync = synchronizer(2);
        assert_eq!(
            sync.insert_barrier(
                DeviceIndex(1),
                DeviceIndex(1),
                PipelineStages::ALL_COMMANDS,
                PipelineStages::ALL_COMMANDS
            ),
            Err(SyncError::SameDeviceBarrier(DeviceIndex(1)))
        );
    }

    #[test]
    fn signals_must_target_their_own_device() {
        let sync = synchronizer(2);
        let tl = sync.create_timeline_semaphore(DeviceIndex(1), 0).unwrap();
        let err = sync
            .resolve_signal(
                DeviceIndex(0),
                &SignalPrimitive::Timeline {
                    timeline: tl,
                    value: 1,
                },
            )
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::DeviceMismatch {
                device: DeviceIndex(0),
                primitive: DeviceIndex(1)
            }
        );
    }
}
