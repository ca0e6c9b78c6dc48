use std::sync::{Condvar, Mutex};
use std::time::Duration;

use super::{lock, wait_on, SyncError};

#[derive(Debug, Default)]
struct EventState {
    signaled: bool,
    destroyed: bool,
}

/// Binary one-shot primitive. Stays signaled until reset.
#[derive(Debug, Default)]
pub(crate) struct Event {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns `Ok(false)` if the event was already signaled.
    pub(crate) fn signal(&self) -> Result<bool, SyncError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }
        if state.signaled {
            return Ok(false);
        }
        state.signaled = true;
        drop(state);
        self.cond.notify_all();
        Ok(true)
    }

    pub(crate) fn reset(&self) -> Result<(), SyncError> {
        let mut state = lock(&self.state);
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }
        state.signaled = false;
        Ok(())
    }

    pub(crate) fn is_signaled(&self) -> Result<bool, SyncError> {
        let state = lock(&self.state);
        if state.destroyed {
            return Err(SyncError::Destroyed);
        }
        Ok(state.signaled)
    }

    pub(crate) fn wait(&self, timeout: Option<Duration>) -> Result<bool, SyncError> {
        wait_on(&self.state, &self.cond, timeout, |state| {
            if state.destroyed {
                Err(SyncError::Destroyed)
            } else {
                Ok(state.signaled)
            }
        })
    }

    pub(crate) fn destroy(&self) {
        lock(&self.state).destroyed = true;
        self.cond.notify_all();
    }
}
