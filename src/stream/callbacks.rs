//! Client callback interfaces and the per-stream callback table

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::state::{StateChangeReason, StreamState};
use crate::dispatch::{EventSink, StreamEvent};

pub trait StreamCallback: Send + Sync {
    fn on_state_change(&self, state: StreamState, reason: StateChangeReason);
}

/// Mark position reached
pub trait PositionCallback: Send + Sync {
    fn on_mark_reached(&self, frame_position: u64);
}

/// One period of frames transferred
pub trait PeriodPositionCallback: Send + Sync {
    fn on_period_reached(&self, frame_count: u64);
}

/// Pull-mode renderer wants another buffer
pub trait WriteCallback: Send + Sync {
    fn on_write_data(&self, length: usize);
}

/// Pull-mode capturer has a filled buffer
pub trait ReadCallback: Send + Sync {
    fn on_read_data(&self, length: usize);
}

impl<F> StreamCallback for F
where
    F: Fn(StreamState, StateChangeReason) + Send + Sync,
{
    fn on_state_change(&self, state: StreamState, reason: StateChangeReason) {
        self(state, reason)
    }
}

impl<F> PositionCallback for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_mark_reached(&self, frame_position: u64) {
        self(frame_position)
    }
}

impl<F> PeriodPositionCallback for F
where
    F: Fn(u64) + Send + Sync,
{
    fn on_period_reached(&self, frame_count: u64) {
        self(frame_count)
    }
}

impl<F> WriteCallback for F
where
    F: Fn(usize) + Send + Sync,
{
    fn on_write_data(&self, length: usize) {
        self(length)
    }
}

impl<F> ReadCallback for F
where
    F: Fn(usize) + Send + Sync,
{
    fn on_read_data(&self, length: usize) {
        self(length)
    }
}

/// Registered callbacks, one lock per kind
#[derive(Default)]
pub struct CallbackTable {
    state: Mutex<Option<Arc<dyn StreamCallback>>>,
    mark: Mutex<Option<Arc<dyn PositionCallback>>>,
    period: Mutex<Option<Arc<dyn PeriodPositionCallback>>>,
    write: Mutex<Option<Arc<dyn WriteCallback>>>,
    read: Mutex<Option<Arc<dyn ReadCallback>>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stream_callback(&self, callback: Option<Arc<dyn StreamCallback>>) {
        *self.state.lock() = callback;
    }

    pub fn set_mark_callback(&self, callback: Option<Arc<dyn PositionCallback>>) {
        *self.mark.lock() = callback;
    }

    pub fn set_period_callback(&self, callback: Option<Arc<dyn PeriodPositionCallback>>) {
        *self.period.lock() = callback;
    }

    pub fn set_write_callback(&self, callback: Option<Arc<dyn WriteCallback>>) {
        *self.write.lock() = callback;
    }

    pub fn set_read_callback(&self, callback: Option<Arc<dyn ReadCallback>>) {
        *self.read.lock() = callback;
    }

    pub fn write_callback(&self) -> Option<Arc<dyn WriteCallback>> {
        self.write.lock().clone()
    }

    pub fn read_callback(&self) -> Option<Arc<dyn ReadCallback>> {
        self.read.lock().clone()
    }
}

impl EventSink for CallbackTable {
    fn deliver(&self, event: StreamEvent) {
        // clone out of the lock so a callback may re-register itself
        match event {
            StreamEvent::StateChanged { state, reason } => {
                let callback = self.state.lock().clone();
                if let Some(callback) = callback {
                    callback.on_state_change(state, reason);
                }
            }
            StreamEvent::MarkReached(position) => {
                let callback = self.mark.lock().clone();
                match callback {
                    Some(callback) => callback.on_mark_reached(position),
                    None => debug!(position, "Mark reached with no callback"),
                }
            }
            StreamEvent::PeriodReached(frames) => {
                let callback = self.period.lock().clone();
                if let Some(callback) = callback {
                    callback.on_period_reached(frames);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_closures_receive_events() {
        let table = CallbackTable::new();
        let marks = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&marks);
        table.set_mark_callback(Some(Arc::new(move |pos: u64| {
            seen.store(pos, Ordering::SeqCst);
        })));

        table.deliver(StreamEvent::MarkReached(480));
        assert_eq!(marks.load(Ordering::SeqCst), 480);

        table.set_mark_callback(None);
        table.deliver(StreamEvent::MarkReached(960));
        assert_eq!(marks.load(Ordering::SeqCst), 480);
    }

    #[test]
    fn test_state_callback() {
        let table = CallbackTable::new();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        table.set_stream_callback(Some(Arc::new(
            move |state: StreamState, reason: StateChangeReason| sink.lock().push((state, reason)),
        )));
        table.deliver(StreamEvent::StateChanged {
            state: StreamState::Running,
            reason: StateChangeReason::Client,
        });
        assert_eq!(
            *states.lock(),
            vec![(StreamState::Running, StateChangeReason::Client)]
        );
    }
}
