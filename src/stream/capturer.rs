//! Capture client

use std::sync::Arc;

use tracing::debug;

use super::callbacks::{PeriodPositionCallback, PositionCallback, ReadCallback, StreamCallback};
use super::core::{AudioTimestamp, StreamCore};
use super::pull::{BufferDesc, BufferQueueState, CaptureMode};
use super::state::StreamState;
use crate::config::{ClientConfig, StreamConfig, StreamRole};
use crate::error::StreamError;
use crate::ipc::{AudioService, ServiceRegistry};

/// Audio capturer bound to one remote capture stream
pub struct CapturerInClient {
    core: Arc<StreamCore>,
}

impl CapturerInClient {
    pub fn new(service: Arc<dyn AudioService>, config: ClientConfig) -> Result<Self, StreamError> {
        Ok(Self {
            core: StreamCore::new(StreamRole::Capturer, service, config)?,
        })
    }

    /// Create a capturer against the process-wide service
    pub fn create(config: ClientConfig) -> Result<Self, StreamError> {
        let service = ServiceRegistry::global().service()?;
        Self::new(service, config)
    }

    pub fn set_stream_info(&self, config: &StreamConfig) -> Result<(), StreamError> {
        self.core.set_stream_info(config)
    }

    pub fn get_audio_stream_info(&self) -> Result<StreamConfig, StreamError> {
        self.core.stream_config()
    }

    pub fn get_state(&self) -> StreamState {
        self.core.state()
    }

    pub fn start(&self) -> Result<(), StreamError> {
        self.core.start()
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        self.core.pause()
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        self.core.stop()
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        self.core.flush()
    }

    pub fn release(&self) -> Result<(), StreamError> {
        self.core.release()
    }

    /// Read captured PCM into `out`.
    ///
    /// Non-blocking reads return whatever is available, possibly zero.
    /// Blocking reads wait until `out` is full, the stream leaves RUNNING,
    /// or the read timeout passes.
    pub fn read(&self, out: &mut [u8], blocking: bool) -> Result<usize, StreamError> {
        self.core.read(out, blocking)
    }

    pub fn set_capture_mode(&self, mode: CaptureMode) -> Result<(), StreamError> {
        self.core.set_pull_mode(mode == CaptureMode::Callback)
    }

    pub fn get_capture_mode(&self) -> CaptureMode {
        if self.core.is_pull_mode() {
            CaptureMode::Callback
        } else {
            CaptureMode::Normal
        }
    }

    pub fn set_capturer_read_callback(
        &self,
        callback: Arc<dyn ReadCallback>,
    ) -> Result<(), StreamError> {
        if !self.core.is_pull_mode() {
            return Err(StreamError::InvalidParameter(
                "read callback requires callback capture mode".into(),
            ));
        }
        self.core.callbacks().set_read_callback(Some(callback));
        Ok(())
    }

    /// Take the oldest captured buffer
    pub fn get_buffer_desc(&self) -> Result<BufferDesc, StreamError> {
        self.core
            .with_pull("get_buffer_desc", |worker| worker.get_buffer_desc())
    }

    /// Hand a consumed buffer back to the worker
    pub fn enqueue(&self, desc: BufferDesc) -> Result<(), StreamError> {
        self.core.with_pull("enqueue", |worker| worker.enqueue(desc))
    }

    pub fn get_buf_queue_state(&self) -> Result<BufferQueueState, StreamError> {
        self.core
            .with_pull("get_buf_queue_state", |worker| Ok(worker.queue_state()))
    }

    pub fn clear(&self) -> Result<(), StreamError> {
        self.core.with_pull("clear", |worker| {
            worker.clear();
            Ok(())
        })
    }

    pub fn set_stream_callback(&self, callback: Arc<dyn StreamCallback>) {
        self.core.callbacks().set_stream_callback(Some(callback));
    }

    pub fn set_capturer_position_callback(
        &self,
        mark: u64,
        callback: Arc<dyn PositionCallback>,
    ) -> Result<(), StreamError> {
        self.core.set_mark_position(mark, callback)
    }

    pub fn unset_capturer_position_callback(&self) {
        self.core.unset_mark_position();
    }

    pub fn set_capturer_period_position_callback(
        &self,
        period: u64,
        callback: Arc<dyn PeriodPositionCallback>,
    ) -> Result<(), StreamError> {
        self.core.set_period_position(period, callback)
    }

    pub fn unset_capturer_period_position_callback(&self) {
        self.core.unset_period_position();
    }

    pub fn get_audio_session_id(&self) -> Result<u32, StreamError> {
        self.core.session_id()
    }

    pub fn get_audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        self.core.audio_time()
    }

    pub fn get_latency(&self) -> Result<u64, StreamError> {
        self.core.latency()
    }

    pub fn get_buffer_size(&self) -> Result<usize, StreamError> {
        self.core.buffer_size()
    }

    pub fn get_frame_count(&self) -> Result<u32, StreamError> {
        self.core.frame_count()
    }

    pub fn get_frames_read(&self) -> u64 {
        self.core.total_frames()
    }

    pub fn get_bytes_read(&self) -> u64 {
        self.core.total_bytes()
    }

    /// Times the service found the shared buffer full
    pub fn get_overflow_count(&self) -> u32 {
        self.core.overflow_count()
    }
}

impl Drop for CapturerInClient {
    fn drop(&mut self) {
        if self.core.state() != StreamState::Released {
            if let Err(e) = self.core.release() {
                debug!("Release on drop failed: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for CapturerInClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturerInClient")
            .field("state", &self.core.state())
            .field("frames_read", &self.core.total_frames())
            .finish()
    }
}
