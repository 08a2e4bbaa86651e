//! Callback dispatch
//!
//! Each stream owns one dispatch thread. The data path posts events and
//! returns immediately; the thread delivers them in order to the stream's
//! callback table. Posting after shutdown is a no-op.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::stream::{StateChangeReason, StreamState};

/// Event delivered off the data-path thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    StateChanged {
        state: StreamState,
        reason: StateChangeReason,
    },
    MarkReached(u64),
    PeriodReached(u64),
}

/// Receiver of dispatched events
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: StreamEvent);
}

/// Named thread that can be joined with a deadline
pub struct WorkerHandle {
    name: String,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done) = bounded(1);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            body();
            let _ = done_tx.send(());
        })?;
        Ok(Self {
            name,
            handle: Some(handle),
            done,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `timeout` for the thread to finish. A thread that does not
    /// finish in time is detached. Returns whether it was joined.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            debug!(worker = %self.name, "Skipping self-join");
            return false;
        }
        match self.done.recv_timeout(timeout) {
            // a panicking body drops the sender without sending
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!(worker = %self.name, "Worker panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(worker = %self.name, ?timeout, "Worker did not exit in time, detaching");
                false
            }
        }
    }
}

pub struct CallbackDispatcher {
    tx: Mutex<Option<Sender<StreamEvent>>>,
    worker: Mutex<Option<WorkerHandle>>,
    delivered: Arc<AtomicU64>,
}

impl CallbackDispatcher {
    pub fn spawn(name: impl Into<String>, sink: Arc<dyn EventSink>) -> io::Result<Self> {
        let (tx, rx) = unbounded::<StreamEvent>();
        let delivered = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&delivered);

        let worker = WorkerHandle::spawn(name, move || {
            for event in rx.iter() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(event)));
                if outcome.is_err() {
                    warn!(?event, "Stream callback panicked");
                }
                counter.fetch_add(1, Ordering::Release);
            }
        })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            delivered,
        })
    }

    /// Queue an event. Returns false once the dispatcher is shut down.
    pub fn post(&self, event: StreamEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(?event, "Dropping event posted after shutdown");
                false
            }
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Stop accepting events, let the queue drain and join the thread.
    /// Only the first call does anything.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        drop(self.tx.lock().take());
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) => worker.join_timeout(timeout),
            None => true,
        }
    }
}

impl Drop for CallbackDispatcher {
    fn drop(&mut self) {
        // disconnect so the thread exits on its own; never block in drop
        drop(self.tx.lock().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct Recorder {
        events: Mutex<Vec<StreamEvent>>,
    }

    impl EventSink for Recorder {
        fn deliver(&self, event: StreamEvent) {
            if event == StreamEvent::MarkReached(13) {
                panic!("boom");
            }
            self.events.lock().push(event);
        }
    }

    struct Sleeper;

    impl EventSink for Sleeper {
        fn deliver(&self, _: StreamEvent) {
            thread::sleep(Duration::from_millis(500));
        }
    }

    #[test]
    fn test_delivers_in_order_and_survives_panic() {
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        let dispatcher = CallbackDispatcher::spawn("test-dispatch", recorder.clone()).unwrap();

        for i in 0..20 {
            assert!(dispatcher.post(StreamEvent::PeriodReached(i)));
        }
        assert!(dispatcher.post(StreamEvent::MarkReached(13)));
        assert!(dispatcher.post(StreamEvent::MarkReached(14)));
        assert!(dispatcher.shutdown(Duration::from_secs(2)));

        let events = recorder.events.lock();
        let expected: Vec<StreamEvent> = (0..20)
            .map(StreamEvent::PeriodReached)
            .chain(std::iter::once(StreamEvent::MarkReached(14)))
            .collect();
        assert_eq!(*events, expected);
        assert_eq!(dispatcher.delivered(), 22);
    }

    #[test]
    fn test_post_after_shutdown_is_noop() {
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        let dispatcher = CallbackDispatcher::spawn("test-dispatch", recorder.clone()).unwrap();
        assert!(dispatcher.shutdown(Duration::from_secs(1)));
        assert!(dispatcher.shutdown(Duration::from_secs(1)));
        assert!(!dispatcher.post(StreamEvent::MarkReached(1)));
        assert!(!dispatcher.is_running());
        assert!(recorder.events.lock().is_empty());
    }

    #[test]
    fn test_join_is_bounded() {
        let dispatcher = CallbackDispatcher::spawn("test-slow", Arc::new(Sleeper)).unwrap();
        dispatcher.post(StreamEvent::MarkReached(1));
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        assert!(!dispatcher.shutdown(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_worker_handle_join() {
        let worker = WorkerHandle::spawn("test-worker", || thread::sleep(Duration::from_millis(5))).unwrap();
        assert_eq!(worker.name(), "test-worker");
        assert!(worker.join_timeout(Duration::from_secs(1)));
    }
}
