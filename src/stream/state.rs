//! Stream lifecycle state

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Lifecycle of a stream.
///
/// ```text
/// New ──set_stream_info──▶ Prepared ──start──▶ Running ◀──start── Paused
///                                   Running ──pause──▶ Paused
///            Running/Paused ──stop──▶ (Stopping) ──▶ Stopped ──start──▶ Running
///                     any ──release──▶ Released (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    New,
    Prepared,
    Running,
    Paused,
    /// Pull-mode only, between a stop request and its ack
    Stopping,
    Stopped,
    Released,
    /// A stop failed in a way that leaves the remote state unknown
    Invalid,
}

impl StreamState {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::New => "new",
            StreamState::Prepared => "prepared",
            StreamState::Running => "running",
            StreamState::Paused => "paused",
            StreamState::Stopping => "stopping",
            StreamState::Stopped => "stopped",
            StreamState::Released => "released",
            StreamState::Invalid => "invalid",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateChangeReason {
    Client,
    System,
}

/// Current state plus a condition variable signalled on every change
pub struct StateCell {
    state: Mutex<StreamState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::New),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> StreamState {
        *self.state.lock()
    }

    /// Unconditional transition; returns the previous state
    pub fn set(&self, next: StreamState) -> StreamState {
        let mut state = self.state.lock();
        let prev = std::mem::replace(&mut *state, next);
        self.changed.notify_all();
        prev
    }

    /// Transition only from one of `from`. On mismatch returns the actual
    /// state and changes nothing.
    pub fn transition(&self, from: &[StreamState], next: StreamState) -> Result<StreamState, StreamState> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(*state);
        }
        let prev = std::mem::replace(&mut *state, next);
        self.changed.notify_all();
        Ok(prev)
    }

    /// Block until `done(state)` holds or `timeout` passes; returns the
    /// state observed last.
    pub fn wait_until(&self, done: impl Fn(StreamState) -> bool, timeout: Duration) -> StreamState {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !done(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state
    }

    /// Wake every waiter without changing the state
    pub fn notify(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_transition_guards() {
        let cell = StateCell::new();
        assert_eq!(
            cell.transition(&[StreamState::Prepared], StreamState::Running),
            Err(StreamState::New)
        );
        assert_eq!(cell.get(), StreamState::New);
        assert_eq!(
            cell.transition(&[StreamState::New], StreamState::Prepared),
            Ok(StreamState::New)
        );
        assert_eq!(cell.set(StreamState::Released), StreamState::Prepared);
    }

    #[test]
    fn test_wait_until_wakes_on_change() {
        let cell = Arc::new(StateCell::new());
        let setter = Arc::clone(&cell);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set(StreamState::Running);
        });
        let seen = cell.wait_until(|s| s == StreamState::Running, Duration::from_secs(2));
        assert_eq!(seen, StreamState::Running);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let cell = StateCell::new();
        let seen = cell.wait_until(|s| s == StreamState::Running, Duration::from_millis(10));
        assert_eq!(seen, StreamState::New);
    }
}
