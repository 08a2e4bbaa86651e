//! Pending control operations awaiting their ack
//!
//! One slot per operation kind. The caller arms a slot before sending the
//! request, the listener completes it with the result code, and the caller
//! waits on the slot's channel with a timeout. Once closed, only the
//! release ack can still be armed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::protocol::Operation;
use crate::error::IpcError;

struct Slot {
    id: u64,
    tx: Sender<i64>,
}

/// Handle returned by `arm`, consumed by `wait`
#[derive(Debug)]
pub struct PendingTicket {
    operation: Operation,
    id: u64,
    rx: Receiver<i64>,
}

impl PendingTicket {
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

#[derive(Default)]
pub struct PendingOperations {
    slots: DashMap<Operation, Slot>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the next ack of `operation`. An older waiter on
    /// the same kind is cancelled. Fails with `Cancelled` after `close`,
    /// except for `Release`.
    pub fn arm(&self, operation: Operation) -> Result<PendingTicket, IpcError> {
        if self.rejects(operation) {
            return Err(IpcError::Cancelled(operation.as_str()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        if self.slots.insert(operation, Slot { id, tx }).is_some() {
            warn!(operation = %operation, "Replacing outstanding pending operation");
        }
        // close() may have swept the table before the insert landed
        if self.rejects(operation) {
            self.slots.remove_if(&operation, |_, slot| slot.id == id);
            return Err(IpcError::Cancelled(operation.as_str()));
        }
        Ok(PendingTicket { operation, id, rx })
    }

    fn rejects(&self, operation: Operation) -> bool {
        operation != Operation::Release && self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an ack. Returns false when nobody is waiting for it.
    pub fn complete(&self, operation: Operation, result: i64) -> bool {
        match self.slots.remove(&operation) {
            Some((_, slot)) => slot.tx.try_send(result).is_ok(),
            None => {
                debug!(operation = %operation, result, "Ack with no waiter");
                false
            }
        }
    }

    pub fn wait(&self, ticket: PendingTicket, timeout: Duration) -> Result<i64, IpcError> {
        match ticket.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                self.slots
                    .remove_if(&ticket.operation, |_, slot| slot.id == ticket.id);
                Err(IpcError::Timeout(ticket.operation.as_str()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(IpcError::Cancelled(ticket.operation.as_str()))
            }
        }
    }

    /// Withdraw a ticket whose request never went out
    pub fn disarm(&self, ticket: PendingTicket) {
        self.slots
            .remove_if(&ticket.operation, |_, slot| slot.id == ticket.id);
    }

    pub fn is_armed(&self, operation: Operation) -> bool {
        self.slots.contains_key(&operation)
    }

    /// Drop every slot so all current waiters return `Cancelled` at once.
    pub fn cancel_all(&self) {
        self.slots.clear();
    }

    /// Cancel every waiter and refuse later arms, `Release` excepted
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_complete_wakes_waiter() {
        let pending = Arc::new(PendingOperations::new());
        let ticket = pending.arm(Operation::Start).unwrap();

        let remote = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.complete(Operation::Start, 0)
        });

        assert_eq!(pending.wait(ticket, Duration::from_secs(2)), Ok(0));
        assert!(handle.join().unwrap());
        assert!(!pending.is_armed(Operation::Start));
    }

    #[test]
    fn test_mismatched_kind_times_out() {
        let pending = PendingOperations::new();
        let ticket = pending.arm(Operation::Pause).unwrap();
        assert!(!pending.complete(Operation::Stop, 0));
        assert_eq!(
            pending.wait(ticket, Duration::from_millis(20)),
            Err(IpcError::Timeout("pause"))
        );
        assert!(!pending.is_armed(Operation::Pause));
    }

    #[test]
    fn test_timeout_keeps_newer_slot() {
        let pending = PendingOperations::new();
        let old = pending.arm(Operation::Flush).unwrap();
        let _new = pending.arm(Operation::Flush).unwrap();
        // the old ticket lost its sender when replaced
        assert_eq!(
            pending.wait(old, Duration::from_millis(10)),
            Err(IpcError::Cancelled("flush"))
        );
        assert!(pending.is_armed(Operation::Flush));
    }

    #[test]
    fn test_disarm_only_removes_own_slot() {
        let pending = PendingOperations::new();
        let first = pending.arm(Operation::Stop).unwrap();
        pending.disarm(first);
        assert!(!pending.is_armed(Operation::Stop));
        assert!(!pending.complete(Operation::Stop, 0));
    }

    #[test]
    fn test_cancel_all_unblocks_promptly() {
        let pending = Arc::new(PendingOperations::new());
        let ticket = pending.arm(Operation::Drain).unwrap();

        let canceller = Arc::clone(&pending);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            canceller.cancel_all();
        });

        let started = Instant::now();
        assert_eq!(
            pending.wait(ticket, Duration::from_secs(5)),
            Err(IpcError::Cancelled("drain"))
        );
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_closed_table_refuses_new_waiters() {
        let pending = PendingOperations::new();
        let waiting = pending.arm(Operation::Start).unwrap();
        pending.close();
        assert!(pending.is_closed());

        let started = Instant::now();
        assert_eq!(
            pending.wait(waiting, Duration::from_secs(8)),
            Err(IpcError::Cancelled("start"))
        );
        assert_eq!(
            pending.arm(Operation::Stop).unwrap_err(),
            IpcError::Cancelled("stop")
        );
        assert!(!pending.is_armed(Operation::Stop));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_release_ack_survives_close() {
        let pending = PendingOperations::new();
        pending.close();
        let ticket = pending.arm(Operation::Release).unwrap();
        assert!(pending.complete(Operation::Release, 0));
        assert_eq!(pending.wait(ticket, Duration::from_secs(1)), Ok(0));
    }
}
