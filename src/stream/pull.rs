//! Callback-driven data exchange
//!
//! In callback mode the client does not call `write`/`read` itself. A worker
//! thread moves fixed-size buffers between a free pool and a small bounded
//! queue, and tells the client through its write/read callback when the
//! next buffer is wanted or ready.
//!
//! ```text
//! render:  free ──get_buffer_desc──▶ client fills ──enqueue──▶ filled ──worker──▶ write
//! capture: free ──worker read──▶ filled ──get_buffer_desc──▶ client ──enqueue──▶ free
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{
    bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::core::StreamCore;
use super::state::StreamState;
use crate::dispatch::WorkerHandle;
use crate::error::StreamError;

/// Idle re-check interval for the worker
const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RenderMode {
    #[default]
    Normal,
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CaptureMode {
    #[default]
    Normal,
    Callback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullMode {
    Render,
    Capture,
}

/// A buffer on loan to or from the client
#[derive(Debug)]
pub struct BufferDesc {
    pub buffer: BytesMut,
    /// Bytes of `buffer` that carry audio
    pub data_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferQueueState {
    /// Buffers waiting in the filled queue
    pub num_buffers: usize,
    /// Buffers the worker has handled so far
    pub current_index: u64,
}

struct PullQueue {
    buffer_size: usize,
    bytes_per_frame: usize,
    free: ArrayQueue<BytesMut>,
    filled_tx: Sender<BufferDesc>,
    filled_rx: Receiver<BufferDesc>,
    current_index: AtomicU64,
}

impl PullQueue {
    fn new(buffer_size: usize, bytes_per_frame: usize, capacity: usize) -> Self {
        let (filled_tx, filled_rx) = bounded(capacity);
        let queue = Self {
            buffer_size,
            bytes_per_frame: bytes_per_frame.max(1),
            free: ArrayQueue::new(capacity),
            filled_tx,
            filled_rx,
            current_index: AtomicU64::new(0),
        };
        for _ in 0..capacity {
            queue.recycle(BytesMut::with_capacity(buffer_size));
        }
        queue
    }

    fn take_free(&self) -> Option<BytesMut> {
        self.free.pop()
    }

    fn recycle(&self, mut buffer: BytesMut) {
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        if self.free.push(buffer).is_err() {
            debug!("Free pool full, dropping buffer");
        }
    }

    fn state(&self) -> BufferQueueState {
        BufferQueueState {
            num_buffers: self.filled_rx.len(),
            current_index: self.current_index.load(Ordering::Acquire),
        }
    }

    fn clear(&self) {
        while let Ok(desc) = self.filled_rx.try_recv() {
            self.recycle(desc.buffer);
        }
    }
}

pub(crate) struct PullWorker {
    mode: PullMode,
    queue: Arc<PullQueue>,
    cancel: Sender<()>,
    handle: WorkerHandle,
}

impl PullWorker {
    pub fn spawn(
        core: &Arc<StreamCore>,
        mode: PullMode,
        buffer_size: usize,
        capacity: usize,
    ) -> Result<Self, StreamError> {
        let bytes_per_frame = core.session("set_pull_mode")?.bytes_per_frame;
        let queue = Arc::new(PullQueue::new(buffer_size, bytes_per_frame, capacity));
        let (cancel, cancelled) = bounded::<()>(0);

        let weak = Arc::downgrade(core);
        let worker_queue = Arc::clone(&queue);
        let handle = WorkerHandle::spawn(format!("{}-pull", core.name()), move || match mode {
            PullMode::Render => render_loop(weak, worker_queue, cancelled),
            PullMode::Capture => capture_loop(weak, worker_queue, cancelled),
        })
        .map_err(|e| StreamError::Resource(e.to_string()))?;

        Ok(Self {
            mode,
            queue,
            cancel,
            handle,
        })
    }

    pub fn stop(self, timeout: Duration) {
        drop(self.cancel);
        self.handle.join_timeout(timeout);
    }

    /// Render: a free buffer to fill. Capture: the oldest filled buffer.
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        match self.mode {
            PullMode::Render => self
                .queue
                .take_free()
                .map(|buffer| BufferDesc {
                    buffer,
                    data_length: 0,
                })
                .ok_or_else(|| StreamError::Resource("no free buffer".into())),
            PullMode::Capture => self
                .queue
                .filled_rx
                .try_recv()
                .map_err(|_| StreamError::Resource("no captured buffer ready".into())),
        }
    }

    /// Render: queue a filled buffer for writing. Capture: give a buffer back.
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), StreamError> {
        match self.mode {
            PullMode::Render => {
                let bpf = self.queue.bytes_per_frame;
                if desc.data_length == 0
                    || desc.data_length > desc.buffer.len()
                    || desc.data_length % bpf != 0
                {
                    let length = desc.data_length;
                    self.queue.recycle(desc.buffer);
                    return Err(StreamError::InvalidParameter(format!(
                        "data length {length} is not a whole number of frames within the buffer"
                    )));
                }
                self.queue.filled_tx.try_send(desc).map_err(|e| match e {
                    TrySendError::Full(desc) | TrySendError::Disconnected(desc) => {
                        self.queue.recycle(desc.buffer);
                        StreamError::Resource("buffer queue full".into())
                    }
                })
            }
            PullMode::Capture => {
                self.queue.recycle(desc.buffer);
                Ok(())
            }
        }
    }

    pub fn queue_state(&self) -> BufferQueueState {
        self.queue.state()
    }

    pub fn clear(&self) {
        self.queue.clear();
    }
}

fn is_cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

/// Wait for RUNNING. `None` means the worker should exit.
fn await_running(core: &StreamCore) -> Option<bool> {
    let state = core.state_cell().wait_until(
        |s| matches!(s, StreamState::Running | StreamState::Released),
        IDLE_WAIT,
    );
    match state {
        StreamState::Released => None,
        StreamState::Running => Some(true),
        _ => Some(false),
    }
}

fn render_loop(weak: Weak<StreamCore>, queue: Arc<PullQueue>, cancel: Receiver<()>) {
    let mut primed = false;
    let mut carry: Vec<u8> = Vec::new();
    loop {
        if is_cancelled(&cancel) {
            break;
        }
        let Some(core) = weak.upgrade() else { break };
        match await_running(&core) {
            None => break,
            Some(false) => {
                primed = false;
                continue;
            }
            Some(true) => {}
        }

        // ask for as many buffers as the pool holds on entering RUNNING
        if !primed {
            primed = true;
            if let Some(callback) = core.callbacks().write_callback() {
                for _ in 0..queue.free.len() {
                    callback.on_write_data(queue.buffer_size);
                }
            }
        }
        drop(core);

        let mut next = None;
        select! {
            recv(queue.filled_rx) -> msg => next = msg.ok(),
            recv(cancel) -> _ => {},
            default(IDLE_WAIT) => {},
        }
        // a disconnected cancel channel is caught at the top of the loop
        let Some(desc) = next else { continue };
        let Some(core) = weak.upgrade() else { break };
        queue.current_index.fetch_add(1, Ordering::AcqRel);

        write_with_speed(&core, &desc.buffer[..desc.data_length], &mut carry);
        queue.recycle(desc.buffer);
        if let Some(callback) = core.callbacks().write_callback() {
            callback.on_write_data(queue.buffer_size);
        }
    }
    debug!("Render pull worker exited");
}

/// Feed one client buffer to the data path, through the speed transform
/// when one is active. Transformed output is written in chunks of the
/// input size; the tail waits in `carry` for the next buffer.
fn write_with_speed(core: &StreamCore, data: &[u8], carry: &mut Vec<u8>) {
    let transformed = {
        let mut speed = core.speed_slot().lock();
        match speed.as_mut() {
            Some(transform) if (transform.speed() - 1.0).abs() > f32::EPSILON => {
                transform.process(data, carry);
                true
            }
            _ => false,
        }
    };
    if !transformed {
        if let Err(e) = core.write(data) {
            warn!(stream = %core.name(), "Pull write failed: {}", e);
        }
        return;
    }

    let chunk = data.len();
    while chunk > 0 && carry.len() >= chunk {
        let piece: Vec<u8> = carry.drain(..chunk).collect();
        if let Err(e) = core.write(&piece) {
            warn!(stream = %core.name(), "Pull write failed: {}", e);
            break;
        }
    }
}

fn capture_loop(weak: Weak<StreamCore>, queue: Arc<PullQueue>, cancel: Receiver<()>) {
    loop {
        if is_cancelled(&cancel) {
            break;
        }
        let Some(core) = weak.upgrade() else { break };
        match await_running(&core) {
            None => break,
            Some(false) => continue,
            Some(true) => {}
        }

        let mut buffer = match queue.take_free() {
            Some(buffer) => buffer,
            None => {
                drop(core);
                if matches!(cancel.recv_timeout(IDLE_WAIT), Err(RecvTimeoutError::Disconnected)) {
                    break;
                }
                continue;
            }
        };

        match core.read(&mut buffer[..], true) {
            Ok(length) if length > 0 => {
                queue.current_index.fetch_add(1, Ordering::AcqRel);
                let desc = BufferDesc {
                    buffer,
                    data_length: length,
                };
                match queue.filled_tx.try_send(desc) {
                    Ok(()) => {
                        if let Some(callback) = core.callbacks().read_callback() {
                            callback.on_read_data(length);
                        }
                    }
                    Err(e) => queue.recycle(e.into_inner().buffer),
                }
            }
            Ok(_) => queue.recycle(buffer),
            Err(e) => {
                debug!(stream = %core.name(), "Pull read returned: {}", e);
                queue.recycle(buffer);
            }
        }
    }
    debug!("Capture pull worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_recycles_buffers() {
        let queue = PullQueue::new(16, 4, 3);
        assert_eq!(queue.free.len(), 3);

        let buffer = queue.take_free().unwrap();
        assert_eq!(buffer.len(), 16);
        queue
            .filled_tx
            .try_send(BufferDesc {
                buffer,
                data_length: 8,
            })
            .unwrap();
        assert_eq!(queue.state().num_buffers, 1);

        queue.clear();
        assert_eq!(queue.state().num_buffers, 0);
        assert_eq!(queue.free.len(), 3);
    }
}
