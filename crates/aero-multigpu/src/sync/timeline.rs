use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{lock, wait_on, SyncError};

#[derive(Debug)]
struct TimelineState {
    value: u64,
    destroyed: bool,
}

/// Monotonic 64-bit counter that waiters block on.
///
/// Also backs the per-device frame completion counters.
#[derive(Debug)]
pub(crate) struct Timeline {
    state: Mutex<TimelineState>,
    cond: Condvar,
}

impl Timeline {
    pub(crate) fn new(initial_value: u64) -> Self {
        Self {
            state: Mutex::new(TimelineState {
                value: initial_value,
                destroyed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn value(&self) -> Result<u64, SyncError> {
        let state = lock(&self.state);
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }
        Ok(state.value)
    }

    /// Advance to `value`. Returns `Ok(false)` when the timeline is already at `value`.
    pub(crate) fn signal(&self, value: u64) -> Result<bool, SyncError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }
        if value < state.value {
            return Err(SyncError::NonMonotonicSignal {
                current: state.value,
                requested: value,
            });
        }
        if value == state.value {
            return Ok(false);
        }
        state.value = value;
        drop(state);
        self.cond.notify_all();
        Ok(true)
    }

    /// Block until the value reaches `value`. `Ok(false)` means the timeout elapsed first.
    pub(crate) fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<bool, SyncError> {
        wait_on(&self.state, &self.cond, timeout, |state| {
            if state.destroyed {
                Err(SyncError::Destroyed)
            } else {
                Ok(state.value >= value)
            }
        })
    }

    pub(crate) fn destroy(&self) {
        lock(&self.state).destroyed = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_is_monotonic() {
        let tl = Timeline::new(5);
        assert_eq!(tl.signal(5), Ok(false));
        assert_eq!(tl.signal(9), Ok(true));
        assert_eq!(
            tl.signal(7),
            Err(SyncError::NonMonotonicSignal {
                current: 9,
                requested: 7
            })
        );
        assert_eq!(tl.value(), Ok(9));
    }

    #[test]
    fn satisfied_wait_returns_immediately() {
        let tl = Timeline::new(3);
        assert_eq!(tl.wait(3, None), Ok(true));
        assert_eq!(tl.wait(4, Some(Duration::ZERO)), Ok(false));
    }

    #[test]
    fn destroy_wakes_blocked_waiters() {
        let tl = Arc::new(Timeline::new(0));
        let waiter = {
            let tl = tl.clone();
            thread::spawn(move || tl.wait(10, None))
        };
        thread::sleep(Duration::from_millis(20));
        tl.destroy();
        assert_eq!(waiter.join().unwrap(), Err(SyncError::Destroyed));
        assert_eq!(tl.signal(11), Err(SyncError::Destroyed));
    }
}
