//! Shared engine behind the renderer and capturer clients
//!
//! Locks, always taken in this order when nested:
//! `control` (lifecycle ops) → `io` (write/read/flush/drain) → the
//! short-lived inner locks (state, buffer, position, dsp).

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::callbacks::CallbackTable;
use super::position::{PositionEvents, PositionTracker};
use super::pull::{PullMode, PullWorker};
use super::state::{StateCell, StateChangeReason, StreamState};
use crate::buffer::{RingCache, SharedRingBuffer};
use crate::config::{ClientConfig, StreamConfig, StreamRole};
use crate::dispatch::{CallbackDispatcher, StreamEvent};
use crate::dsp::blend::apply_blend;
use crate::dsp::{ChannelBlendMode, SoftwareVolume, SpeedTransform};
use crate::error::{IpcError, StreamError};
use crate::format;
use crate::ipc::{
    AudioService, IpcStream, Operation, PendingOperations, StreamListener, OPERATION_SUCCESS,
};

/// Re-check interval while waiting on buffer space or data
const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Presentation time of a frame, as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioTimestamp {
    pub frame_position: u64,
    pub timestamp_ns: i64,
    pub time: DateTime<Utc>,
}

/// Everything negotiated by `set_stream_info`; immutable afterwards
pub(crate) struct Session {
    pub ipc: Arc<dyn IpcStream>,
    pub session_id: u32,
    pub ring: Arc<SharedRingBuffer>,
    pub cache: RingCache,
    pub config: StreamConfig,
    pub bytes_per_frame: usize,
    pub span_bytes: usize,
}

/// Routes service acks into the owning stream without keeping it alive
struct ListenerBridge {
    core: Weak<StreamCore>,
}

impl StreamListener for ListenerBridge {
    fn on_operation_handled(&self, operation: Operation, result: i64) {
        if let Some(core) = self.core.upgrade() {
            core.on_operation_handled(operation, result);
        }
    }
}

pub(crate) struct StreamCore {
    role: StreamRole,
    name: String,
    service: Arc<dyn AudioService>,
    client_config: ClientConfig,
    state: StateCell,
    control: Mutex<()>,
    /// Serializes the data path; holds the span scratch buffer
    io: Mutex<Vec<u8>>,
    session: OnceLock<Session>,
    pending: PendingOperations,
    buffer_lock: Mutex<()>,
    buffer_cv: Condvar,
    callbacks: Arc<CallbackTable>,
    dispatcher: CallbackDispatcher,
    position: Mutex<PositionTracker>,
    total_bytes: AtomicU64,
    underflow_count: AtomicU32,
    overflow_count: AtomicU32,
    offload: AtomicBool,
    volume: Mutex<SoftwareVolume>,
    blend: Mutex<ChannelBlendMode>,
    speed: Mutex<Option<Box<dyn SpeedTransform>>>,
    renderer_rate: AtomicU32,
    pull: Mutex<Option<PullWorker>>,
}

impl StreamCore {
    pub fn new(
        role: StreamRole,
        service: Arc<dyn AudioService>,
        client_config: ClientConfig,
    ) -> Result<Arc<Self>, StreamError> {
        client_config
            .validate()
            .map_err(|e| StreamError::InvalidParameter(e.to_string()))?;

        let name = match role {
            StreamRole::Renderer => "renderer",
            StreamRole::Capturer => "capturer",
        };
        let callbacks = Arc::new(CallbackTable::new());
        let dispatcher = CallbackDispatcher::spawn(format!("{name}-callbacks"), callbacks.clone())
            .map_err(|e| StreamError::Resource(e.to_string()))?;

        Ok(Arc::new(Self {
            role,
            name: name.to_string(),
            service,
            client_config,
            state: StateCell::new(),
            control: Mutex::new(()),
            io: Mutex::new(Vec::new()),
            session: OnceLock::new(),
            pending: PendingOperations::new(),
            buffer_lock: Mutex::new(()),
            buffer_cv: Condvar::new(),
            callbacks,
            dispatcher,
            position: Mutex::new(PositionTracker::new()),
            total_bytes: AtomicU64::new(0),
            underflow_count: AtomicU32::new(0),
            overflow_count: AtomicU32::new(0),
            offload: AtomicBool::new(false),
            volume: Mutex::new(SoftwareVolume::new()),
            blend: Mutex::new(ChannelBlendMode::Default),
            speed: Mutex::new(None),
            renderer_rate: AtomicU32::new(0),
            pull: Mutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn state_cell(&self) -> &StateCell {
        &self.state
    }

    pub fn callbacks(&self) -> &CallbackTable {
        &self.callbacks
    }

    pub(crate) fn session(&self, operation: &'static str) -> Result<&Session, StreamError> {
        self.session
            .get()
            .ok_or_else(|| StreamError::illegal(operation, self.state.get()))
    }

    fn post_state(&self, state: StreamState, reason: StateChangeReason) {
        self.dispatcher
            .post(StreamEvent::StateChanged { state, reason });
    }

    fn operation_timeout(&self) -> Duration {
        self.client_config
            .operation_timeout(self.offload.load(Ordering::Acquire))
    }

    // ── setup ────────────────────────────────────────────────────────────

    pub fn set_stream_info(self: &Arc<Self>, config: &StreamConfig) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if state != StreamState::New {
            return Err(StreamError::illegal("set_stream_info", state));
        }
        format::validate(config, self.role)?;

        let handle = self.service.create_stream(config, self.role)?;
        match self.negotiate(config, Arc::clone(&handle.stream), handle.session_id) {
            Ok(session) => {
                let session_id = session.session_id;
                let span_bytes = session.span_bytes;
                if self.session.set(session).is_err() {
                    return Err(StreamError::illegal("set_stream_info", self.state.get()));
                }
                self.state
                    .transition(&[StreamState::New], StreamState::Prepared)
                    .map_err(|actual| StreamError::illegal("set_stream_info", actual))?;
                info!(
                    stream = %self.name,
                    session_id,
                    rate = config.sample_rate,
                    channels = config.channels,
                    format = ?config.format,
                    span_bytes,
                    "Stream prepared"
                );
                self.post_state(StreamState::Prepared, StateChangeReason::Client);
                Ok(())
            }
            Err(e) => {
                error!(stream = %self.name, "Stream setup failed: {}", e);
                if let Err(release_err) = handle.stream.release() {
                    debug!("Releasing half-created stream failed: {}", release_err);
                }
                Err(e)
            }
        }
    }

    fn negotiate(
        self: &Arc<Self>,
        config: &StreamConfig,
        ipc: Arc<dyn IpcStream>,
        session_id: u32,
    ) -> Result<Session, StreamError> {
        ipc.register_stream_listener(Arc::new(ListenerBridge {
            core: Arc::downgrade(self),
        }))?;
        let ring = ipc.resolve_buffer()?;

        let bytes_per_frame = config.bytes_per_frame();
        if ring.bytes_per_frame() as usize != bytes_per_frame {
            return Err(StreamError::Resource(format!(
                "service negotiated {} bytes per frame, expected {}",
                ring.bytes_per_frame(),
                bytes_per_frame
            )));
        }
        let span_bytes = ring.span_bytes();
        let cache = RingCache::create(span_bytes * self.client_config.cache_spans)?;
        debug!(
            total_frames = ring.total_frames(),
            span_frames = ring.span_frames(),
            cache_size = cache.cache_size(),
            "Buffers negotiated"
        );

        Ok(Session {
            ipc,
            session_id,
            ring,
            cache,
            config: config.clone(),
            bytes_per_frame,
            span_bytes,
        })
    }

    // ── lifecycle ────────────────────────────────────────────────────────

    /// Send a lifecycle request and wait for its ack
    fn remote_op(
        &self,
        session: &Session,
        operation: Operation,
        timeout: Duration,
        send: impl FnOnce(&dyn IpcStream) -> Result<(), IpcError>,
    ) -> Result<(), StreamError> {
        let ticket = self
            .pending
            .arm(operation)
            .map_err(|_| StreamError::illegal(operation.as_str(), self.state.get()))?;
        if let Err(e) = send(session.ipc.as_ref()) {
            self.pending.disarm(ticket);
            error!(stream = %self.name, operation = %operation, "Request failed: {}", e);
            return Err(e.into());
        }

        match self.pending.wait(ticket, timeout) {
            Ok(OPERATION_SUCCESS) => Ok(()),
            Ok(code) => {
                error!(stream = %self.name, operation = %operation, code, "Remote operation failed");
                Err(StreamError::RemoteFailure {
                    operation: operation.as_str(),
                    code,
                })
            }
            Err(IpcError::Timeout(_)) => {
                warn!(stream = %self.name, operation = %operation, ?timeout, "Ack timed out");
                Err(StreamError::RemoteTimeout {
                    operation: operation.as_str(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Err(IpcError::Cancelled(_)) => {
                Err(StreamError::illegal(operation.as_str(), self.state.get()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn start(&self) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if !matches!(
            state,
            StreamState::Prepared | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(StreamError::illegal("start", state));
        }
        let session = self.session("start")?;
        self.remote_op(session, Operation::Start, self.operation_timeout(), |ipc| {
            ipc.start()
        })?;

        self.state
            .transition(&[state], StreamState::Running)
            .map_err(|actual| StreamError::illegal("start", actual))?;
        info!(stream = %self.name, session_id = session.session_id, "Stream started");
        self.post_state(StreamState::Running, StateChangeReason::Client);
        Ok(())
    }

    pub fn pause(&self) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if state != StreamState::Running {
            return Err(StreamError::illegal("pause", state));
        }
        let session = self.session("pause")?;
        self.remote_op(session, Operation::Pause, self.operation_timeout(), |ipc| {
            ipc.pause()
        })?;

        self.state
            .transition(&[StreamState::Running], StreamState::Paused)
            .map_err(|actual| StreamError::illegal("pause", actual))?;
        info!(stream = %self.name, session_id = session.session_id, "Stream paused");
        self.post_state(StreamState::Paused, StateChangeReason::Client);
        self.notify_buffer();
        Ok(())
    }

    pub fn stop(&self) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if !matches!(state, StreamState::Running | StreamState::Paused) {
            return Err(StreamError::illegal("stop", state));
        }
        let session = self.session("stop")?;

        // let the pull worker wind down before the ack comes back
        let pull_mode = self.pull.lock().is_some();
        if pull_mode {
            self.state
                .transition(&[state], StreamState::Stopping)
                .map_err(|actual| StreamError::illegal("stop", actual))?;
            self.notify_buffer();
        }

        let result = self.remote_op(session, Operation::Stop, self.operation_timeout(), |ipc| {
            ipc.stop()
        });
        let from = if pull_mode { StreamState::Stopping } else { state };
        match result {
            Ok(()) => {
                self.state
                    .transition(&[from], StreamState::Stopped)
                    .map_err(|actual| StreamError::illegal("stop", actual))?;
                info!(stream = %self.name, session_id = session.session_id, "Stream stopped");
                self.post_state(StreamState::Stopped, StateChangeReason::Client);
                self.notify_buffer();
                Ok(())
            }
            Err(e @ StreamError::RemoteTimeout { .. }) => {
                if pull_mode {
                    let _ = self.state.transition(&[StreamState::Stopping], state);
                }
                Err(e)
            }
            Err(e) => {
                if self.state.transition(&[from], StreamState::Invalid).is_ok() {
                    error!(stream = %self.name, "Stop failed, stream state unknown: {}", e);
                    self.post_state(StreamState::Invalid, StateChangeReason::System);
                }
                Err(e)
            }
        }
    }

    pub fn flush(&self) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if !matches!(
            state,
            StreamState::Running | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(StreamError::illegal("flush", state));
        }
        let session = self.session("flush")?;
        let _io = self.io.lock();

        self.remote_op(session, Operation::Flush, self.operation_timeout(), |ipc| {
            ipc.flush()
        })?;
        session
            .cache
            .reconfig(session.cache.cache_size(), false)?;
        if let Some(speed) = self.speed.lock().as_mut() {
            speed.reset();
        }
        info!(stream = %self.name, session_id = session.session_id, "Stream flushed");
        Ok(())
    }

    pub fn drain(&self) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if state != StreamState::Running {
            return Err(StreamError::illegal("drain", state));
        }
        let session = self.session("drain")?;
        let mut scratch = self.io.lock();

        let remainder = session.cache.readable_size() % session.span_bytes;
        if remainder > 0 {
            let silence = vec![silence_byte(&session.config); session.span_bytes - remainder];
            session.cache.enqueue(&silence)?;
        }
        let deadline = Instant::now() + self.client_config.drain_cache_timeout();
        while session.cache.readable_size() >= session.span_bytes {
            self.push_span(session, &mut scratch, deadline, "drain")?;
        }

        self.remote_op(session, Operation::Drain, self.operation_timeout(), |ipc| {
            ipc.drain()
        })?;
        info!(stream = %self.name, session_id = session.session_id, "Stream drained");
        Ok(())
    }

    /// Terminal. Wakes every blocked thread, stops workers, tells the
    /// service and shuts the dispatcher down.
    pub fn release(&self) -> Result<(), StreamError> {
        let prev = self.state.set(StreamState::Released);
        if prev == StreamState::Released {
            return Err(StreamError::illegal("release", prev));
        }
        self.notify_buffer();
        self.pending.close();
        self.stop_pull_worker();

        let _control = self.control.lock();
        if let Some(session) = self.session.get() {
            let timeout = self.operation_timeout();
            if let Err(e) = self.remote_op(session, Operation::Release, timeout, |ipc| ipc.release()) {
                warn!(stream = %self.name, session_id = session.session_id, "Remote release failed: {}", e);
            }
        }
        info!(stream = %self.name, from = %prev, "Stream released");

        self.post_state(StreamState::Released, StateChangeReason::Client);
        self.dispatcher
            .shutdown(self.client_config.worker_join_timeout());
        Ok(())
    }

    // ── data path ────────────────────────────────────────────────────────

    /// Wake threads waiting for buffer space or data
    pub(crate) fn notify_buffer(&self) {
        let _guard = self.buffer_lock.lock();
        self.buffer_cv.notify_all();
    }

    fn wait_buffer(&self, deadline: Instant) {
        let wake = deadline.min(Instant::now() + BUFFER_POLL_INTERVAL);
        let mut guard = self.buffer_lock.lock();
        let _ = self.buffer_cv.wait_until(&mut guard, wake);
    }

    fn check_transfer_state(&self, operation: &'static str) -> Result<(), StreamError> {
        match self.state.get() {
            StreamState::Running => Ok(()),
            other => Err(StreamError::illegal(operation, other)),
        }
    }

    /// Move one span from the cache into the shared ring, waiting for room
    /// until `deadline`.
    fn push_span(
        &self,
        session: &Session,
        scratch: &mut Vec<u8>,
        deadline: Instant,
        operation: &'static str,
    ) -> Result<(), StreamError> {
        let ring = &session.ring;
        let span_frames = ring.span_frames() as u64;
        loop {
            if ring.writable_frames() >= span_frames {
                break;
            }
            let state = self.state.get();
            if matches!(state, StreamState::Released | StreamState::Invalid) {
                return Err(StreamError::illegal(operation, state));
            }
            if Instant::now() >= deadline {
                warn!(stream = %self.name, operation, "No free span in shared buffer");
                return Err(StreamError::RemoteTimeout {
                    operation,
                    timeout_ms: self.client_config.write_timeout_ms,
                });
            }
            self.wait_buffer(deadline);
        }

        scratch.resize(session.span_bytes, 0);
        session.cache.dequeue(scratch)?;
        let frame = ring.cur_write_frame();
        ring.write_span(frame, scratch)?;
        ring.advance_write(span_frames)?;
        if let Err(e) = session.ipc.update_position() {
            warn!(stream = %self.name, "update_position failed: {}", e);
        }
        debug!(stream = %self.name, frame, "Span handed off");
        Ok(())
    }

    /// Volume and blend, in place on a copy when either is active
    fn preprocess<'a>(&self, session: &Session, data: &'a [u8]) -> Cow<'a, [u8]> {
        let blend = *self.blend.lock();
        let mut volume = self.volume.lock();
        if volume.is_unity() && blend == ChannelBlendMode::Default {
            return Cow::Borrowed(data);
        }
        let channels = session.config.channels as usize;
        let mut owned = data.to_vec();
        volume.apply(&mut owned, session.config.format, channels);
        apply_blend(blend, &mut owned, session.config.format, channels);
        Cow::Owned(owned)
    }

    /// Everything a write must satisfy before any byte is touched
    pub(crate) fn check_write(&self, data: &[u8]) -> Result<&Session, StreamError> {
        if data.is_empty() {
            return Err(StreamError::InvalidParameter("empty write".into()));
        }
        self.check_transfer_state("write")?;
        let session = self.session("write")?;
        if data.len() % session.bytes_per_frame != 0 {
            return Err(StreamError::InvalidParameter(format!(
                "write of {} bytes is not a whole number of {}-byte frames",
                data.len(),
                session.bytes_per_frame
            )));
        }
        Ok(session)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        let session = self.check_write(data)?;

        let mut scratch = self.io.lock();
        let data = self.preprocess(session, data);
        let deadline = Instant::now() + self.client_config.write_timeout();
        let mut offset = 0;
        let mut failure = None;
        while offset < data.len() {
            let room = session.cache.writable_size();
            if room > 0 {
                let chunk = room.min(data.len() - offset);
                session.cache.enqueue(&data[offset..offset + chunk])?;
                offset += chunk;
            }
            while session.cache.readable_size() >= session.span_bytes {
                if let Err(e) = self.push_span(session, &mut scratch, deadline, "write") {
                    failure = Some(e);
                    break;
                }
            }
            if failure.is_some() {
                break;
            }
        }
        drop(scratch);

        if offset > 0 {
            self.record_transfer(session, offset);
        }
        match failure {
            Some(e) if offset == 0 => Err(e),
            Some(e) => {
                warn!(stream = %self.name, written = offset, requested = data.len(), "Short write: {}", e);
                Ok(offset)
            }
            None => Ok(offset),
        }
    }

    pub fn read(&self, out: &mut [u8], blocking: bool) -> Result<usize, StreamError> {
        if out.is_empty() {
            return Err(StreamError::InvalidParameter("empty read".into()));
        }
        self.check_transfer_state("read")?;
        let session = self.session("read")?;
        let ring = &session.ring;
        let span_frames = ring.span_frames() as u64;

        let mut scratch = self.io.lock();
        let timeout = self.client_config.read_timeout();
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        loop {
            let take = session.cache.readable_size().min(out.len() - filled);
            if take > 0 {
                session.cache.dequeue(&mut out[filled..filled + take])?;
                filled += take;
            }
            if filled == out.len() {
                break;
            }

            if ring.available_data_frames() >= span_frames {
                scratch.resize(session.span_bytes, 0);
                let frame = ring.cur_read_frame();
                ring.read_span(frame, &mut scratch)?;
                ring.advance_read(span_frames)?;
                if let Err(e) = session.ipc.update_position() {
                    warn!(stream = %self.name, "update_position failed: {}", e);
                }
                session.cache.enqueue(&scratch)?;
                continue;
            }

            if !blocking {
                break;
            }
            let state = self.state.get();
            if state != StreamState::Running {
                if filled == 0 {
                    return Err(StreamError::illegal("read", state));
                }
                break;
            }
            if Instant::now() >= deadline {
                if filled == 0 {
                    warn!(stream = %self.name, ?timeout, "Blocking read timed out");
                    return Err(StreamError::RemoteTimeout {
                        operation: "read",
                        timeout_ms: self.client_config.read_timeout_ms,
                    });
                }
                break;
            }
            self.wait_buffer(deadline);
        }
        drop(scratch);

        if filled > 0 {
            self.record_transfer(session, filled);
        }
        Ok(filled)
    }

    fn record_transfer(&self, session: &Session, bytes: usize) {
        self.total_bytes.fetch_add(bytes as u64, Ordering::AcqRel);
        let frames = match session.bytes_per_frame {
            0 => 0,
            bpf => (bytes / bpf) as u64,
        };
        let events: PositionEvents = self.position.lock().advance(frames);
        if let Some(mark) = events.mark {
            debug!(stream = %self.name, mark, "Mark reached");
            self.dispatcher.post(StreamEvent::MarkReached(mark));
        }
        if let Some(period) = events.period {
            for _ in 0..events.period_count {
                self.dispatcher.post(StreamEvent::PeriodReached(period));
            }
        }
    }

    // ── listener ─────────────────────────────────────────────────────────

    fn on_operation_handled(&self, operation: Operation, result: i64) {
        match operation {
            Operation::BufferUnderrun => {
                self.underflow_count.fetch_add(1, Ordering::Relaxed);
                self.notify_buffer();
            }
            Operation::BufferOverflow => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                self.notify_buffer();
            }
            Operation::UpdateStream => self.notify_buffer(),
            _ => {
                debug!(stream = %self.name, operation = %operation, result, "Ack received");
                self.pending.complete(operation, result);
            }
        }
    }

    // ── position callbacks ───────────────────────────────────────────────

    pub fn set_mark_position(
        &self,
        mark: u64,
        callback: Arc<dyn super::PositionCallback>,
    ) -> Result<(), StreamError> {
        if mark == 0 {
            return Err(StreamError::InvalidParameter("mark position must be positive".into()));
        }
        self.callbacks.set_mark_callback(Some(callback));
        self.position.lock().set_mark(mark);
        Ok(())
    }

    pub fn unset_mark_position(&self) {
        self.position.lock().unset_mark();
        self.callbacks.set_mark_callback(None);
    }

    pub fn set_period_position(
        &self,
        period: u64,
        callback: Arc<dyn super::PeriodPositionCallback>,
    ) -> Result<(), StreamError> {
        if period == 0 {
            return Err(StreamError::InvalidParameter("period must be positive".into()));
        }
        self.callbacks.set_period_callback(Some(callback));
        self.position.lock().set_period(period);
        Ok(())
    }

    pub fn unset_period_position(&self) {
        self.position.lock().unset_period();
        self.callbacks.set_period_callback(None);
    }

    // ── queries ──────────────────────────────────────────────────────────

    pub fn stream_config(&self) -> Result<StreamConfig, StreamError> {
        Ok(self.session("get_audio_stream_info")?.config.clone())
    }

    pub fn session_id(&self) -> Result<u32, StreamError> {
        Ok(self.session("get_audio_session_id")?.session_id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn total_frames(&self) -> u64 {
        match self.session.get() {
            Some(session) if session.bytes_per_frame > 0 => {
                self.total_bytes() / session.bytes_per_frame as u64
            }
            _ => 0,
        }
    }

    pub fn underflow_count(&self) -> u32 {
        self.underflow_count.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn cache_readable(&self) -> usize {
        self.session
            .get()
            .map_or(0, |session| session.cache.readable_size())
    }

    pub fn buffer_size(&self) -> Result<usize, StreamError> {
        Ok(self.session("get_buffer_size")?.span_bytes)
    }

    pub fn frame_count(&self) -> Result<u32, StreamError> {
        Ok(self.session("get_frame_count")?.ring.span_frames())
    }

    pub fn audio_time(&self) -> Result<AudioTimestamp, StreamError> {
        let session = self.session("get_audio_time")?;
        let info = session.ipc.get_audio_time()?;
        let secs = info.timestamp_ns.div_euclid(1_000_000_000);
        let nanos = info.timestamp_ns.rem_euclid(1_000_000_000) as u32;
        let time = DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| StreamError::Resource(format!("bad timestamp {}", info.timestamp_ns)))?;
        Ok(AudioTimestamp {
            frame_position: info.frame_position,
            timestamp_ns: info.timestamp_ns,
            time,
        })
    }

    /// Service latency plus whatever still sits in the local cache, in µs
    pub fn latency(&self) -> Result<u64, StreamError> {
        let session = self.session("get_latency")?;
        let remote = session.ipc.get_latency()?;
        let cached_frames = (session.cache.readable_size() / session.bytes_per_frame.max(1)) as u64;
        let rate = session.config.sample_rate.max(1) as u64;
        Ok(remote + cached_frames * 1_000_000 / rate)
    }

    // ── controls ─────────────────────────────────────────────────────────

    pub fn set_offload_mode(&self, enabled: bool) {
        self.offload.store(enabled, Ordering::Release);
        info!(stream = %self.name, enabled, "Offload mode changed");
    }

    pub fn is_offload(&self) -> bool {
        self.offload.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), StreamError> {
        self.volume.lock().set_volume(volume)
    }

    pub fn set_volume_with_ramp(&self, volume: f32, duration_ms: u32) -> Result<(), StreamError> {
        let rate = self.session("set_volume_with_ramp")?.config.sample_rate;
        self.volume
            .lock()
            .set_volume_with_ramp(volume, duration_ms, rate)
    }

    pub fn volume(&self) -> f32 {
        self.volume.lock().volume()
    }

    pub fn set_channel_blend_mode(&self, mode: ChannelBlendMode) -> Result<(), StreamError> {
        let state = self.state.get();
        if matches!(state, StreamState::Running | StreamState::Released) {
            return Err(StreamError::illegal("set_channel_blend_mode", state));
        }
        *self.blend.lock() = mode;
        Ok(())
    }

    pub fn set_speed_transform(&self, transform: Option<Box<dyn SpeedTransform>>) {
        *self.speed.lock() = transform;
    }

    pub(crate) fn speed_slot(&self) -> &Mutex<Option<Box<dyn SpeedTransform>>> {
        &self.speed
    }

    pub fn set_renderer_sampling_rate(&self, rate: u32) -> Result<(), StreamError> {
        let session = self.session("set_renderer_sampling_rate")?;
        if !format::is_sampling_rate_valid(rate) || rate > session.config.sample_rate {
            return Err(StreamError::InvalidParameter(format!(
                "renderer rate {rate} not usable with stream rate {}",
                session.config.sample_rate
            )));
        }
        self.renderer_rate.store(rate, Ordering::Release);
        Ok(())
    }

    pub fn renderer_sampling_rate(&self) -> Result<u32, StreamError> {
        let session = self.session("get_renderer_sampling_rate")?;
        Ok(match self.renderer_rate.load(Ordering::Acquire) {
            0 => session.config.sample_rate,
            rate => rate,
        })
    }

    pub fn ipc(&self, operation: &'static str) -> Result<&Arc<dyn IpcStream>, StreamError> {
        Ok(&self.session(operation)?.ipc)
    }

    // ── pull mode ────────────────────────────────────────────────────────

    pub fn set_pull_mode(self: &Arc<Self>, enabled: bool) -> Result<(), StreamError> {
        let _control = self.control.lock();
        let state = self.state.get();
        if !matches!(
            state,
            StreamState::Prepared | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(StreamError::illegal("set_pull_mode", state));
        }
        let session = self.session("set_pull_mode")?;
        let mut pull = self.pull.lock();
        match (enabled, pull.is_some()) {
            (true, false) => {
                let mode = match self.role {
                    StreamRole::Renderer => PullMode::Render,
                    StreamRole::Capturer => PullMode::Capture,
                };
                *pull = Some(PullWorker::spawn(
                    self,
                    mode,
                    session.span_bytes,
                    self.client_config.pull_queue_capacity,
                )?);
                info!(stream = %self.name, "Callback mode enabled");
            }
            (false, true) => {
                // the worker's callbacks take this lock; never join while holding it
                let worker = pull.take();
                drop(pull);
                if let Some(worker) = worker {
                    worker.stop(self.client_config.worker_join_timeout());
                }
                info!(stream = %self.name, "Callback mode disabled");
            }
            _ => {}
        }
        Ok(())
    }

    pub fn is_pull_mode(&self) -> bool {
        self.pull.lock().is_some()
    }

    pub(crate) fn with_pull<T>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&PullWorker) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let pull = self.pull.lock();
        match pull.as_ref() {
            Some(worker) => f(worker),
            None => Err(StreamError::illegal(operation, self.state.get())),
        }
    }

    fn stop_pull_worker(&self) {
        let worker = self.pull.lock().take();
        if let Some(worker) = worker {
            worker.stop(self.client_config.worker_join_timeout());
        }
    }
}

fn silence_byte(config: &StreamConfig) -> u8 {
    match config.format {
        format::SampleFormat::U8 => 0x80,
        _ => 0,
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        debug!(stream = %self.name, state = %self.state.get(), "Stream core dropped");
    }
}
