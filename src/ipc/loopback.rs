//! In-process audio service
//!
//! Plays the remote side of the protocol inside the client process: acks
//! lifecycle requests from a worker thread, consumes rendered spans from the
//! shared ring buffer and produces captured ones on request. Ack behavior is
//! configurable so failure paths can be driven deterministically.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{AudioEffectMode, Operation, PrivacyType, RenderRate, OPERATION_SUCCESS};
use super::service::{AudioService, IpcStream, StreamHandle, StreamListener};
use crate::buffer::{BufferGeometry, HandleInfo, SharedRingBuffer};
use crate::config::{StreamConfig, StreamRole};
use crate::constants::{DEFAULT_SPAN_DURATION_MS, SHARED_BUFFER_SPANS};
use crate::error::{BufferError, IpcError};

const FIRST_SESSION_ID: u32 = 100_000;

/// How lifecycle requests are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    #[default]
    Immediate,
    /// Never ack; callers run into their timeout
    Never,
    /// Ack with this non-zero result code
    Fail(i64),
    /// Ack after a delay
    Delayed(Duration),
    /// Never ack this one operation, ack every other one immediately
    NeverFor(Operation),
    /// Fail this one operation with the code, ack every other one
    FailFor(Operation, i64),
}

#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Span length in frames; derived from the sample rate when `None`
    pub span_frames: Option<u32>,
    pub total_spans: u32,
    pub ack_policy: AckPolicy,
    /// Consume one span per position update while running
    pub auto_consume: bool,
    /// Back the ring with a temp file instead of an anonymous mapping
    pub file_backed: bool,
    pub latency_us: u64,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            span_frames: None,
            total_spans: SHARED_BUFFER_SPANS,
            ack_policy: AckPolicy::Immediate,
            auto_consume: true,
            file_backed: false,
            latency_us: 0,
        }
    }
}

pub struct LoopbackService {
    options: LoopbackOptions,
    alive: AtomicBool,
    next_session: AtomicU32,
    last_stream: Mutex<Option<Arc<LoopbackStream>>>,
}

impl LoopbackService {
    pub fn new(options: LoopbackOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            alive: AtomicBool::new(true),
            next_session: AtomicU32::new(FIRST_SESSION_ID),
            last_stream: Mutex::new(None),
        })
    }

    /// Simulate the service process dying
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(stream) = self.last_stream.lock().as_ref() {
            stream.shared.alive.store(false, Ordering::SeqCst);
        }
        warn!("Loopback service killed");
    }

    /// Most recently created stream, for inspection
    pub fn last_stream(&self) -> Option<Arc<LoopbackStream>> {
        self.last_stream.lock().clone()
    }
}

impl AudioService for LoopbackService {
    fn create_stream(&self, config: &StreamConfig, role: StreamRole) -> Result<StreamHandle, IpcError> {
        if !self.is_alive() {
            return Err(IpcError::RemoteDied);
        }
        let span_frames = self
            .options
            .span_frames
            .unwrap_or(config.sample_rate * DEFAULT_SPAN_DURATION_MS / 1000);
        let geometry = BufferGeometry::new(
            span_frames * self.options.total_spans,
            span_frames,
            config.bytes_per_frame() as u32,
        );
        let ring = if self.options.file_backed {
            let path = temp_ring_path();
            SharedRingBuffer::create(&path, geometry)
        } else {
            SharedRingBuffer::create_anonymous(geometry)
        }
        .map_err(|e| IpcError::ServiceUnavailable(e.to_string()))?;

        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let stream = LoopbackStream::spawn(session_id, role, Arc::new(ring), self.options.clone())?;
        info!(session_id, ?role, ?geometry, "Loopback stream created");

        *self.last_stream.lock() = Some(Arc::clone(&stream));
        Ok(StreamHandle {
            stream,
            session_id,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn temp_ring_path() -> PathBuf {
    std::env::temp_dir().join(format!("audio-stream-{}.shm", uuid::Uuid::new_v4()))
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

enum Job {
    Ack(Operation),
    Consume,
    Flush,
    Drain,
    Shutdown,
}

struct Controls {
    running: bool,
    rate: RenderRate,
    low_power_volume: f32,
    effect_mode: AudioEffectMode,
    privacy: PrivacyType,
}

struct LoopShared {
    session_id: u32,
    role: StreamRole,
    ring: Arc<SharedRingBuffer>,
    options: LoopbackOptions,
    alive: AtomicBool,
    controls: Mutex<Controls>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    consumed: Mutex<Vec<u8>>,
    update_position_calls: AtomicU64,
}

impl LoopShared {
    fn notify(&self, operation: Operation, result: i64) {
        let listener = self.listener.lock().clone();
        match listener {
            Some(listener) => listener.on_operation_handled(operation, result),
            None => debug!(operation = %operation, "No listener registered"),
        }
    }

    fn is_running(&self) -> bool {
        self.controls.lock().running
    }

    /// Move one span from the ring into the consumed log
    fn consume_span(&self) -> bool {
        let span_frames = self.ring.span_frames() as u64;
        if self.ring.available_data_frames() < span_frames {
            return false;
        }
        let mut span = vec![0u8; self.ring.span_bytes()];
        let frame = self.ring.cur_read_frame();
        if let Err(e) = self.ring.read_span(frame, &mut span) {
            warn!(session_id = self.session_id, "Loopback consume failed: {}", e);
            return false;
        }
        match self.ring.advance_read(span_frames) {
            Ok(read) => self.ring.set_handle_info(read, now_ns()),
            Err(e) => {
                warn!(session_id = self.session_id, "Loopback advance failed: {}", e);
                return false;
            }
        }
        self.consumed.lock().extend_from_slice(&span);
        true
    }

    fn ack_result(&self, operation: Operation) -> Option<i64> {
        match self.options.ack_policy {
            AckPolicy::Immediate => Some(OPERATION_SUCCESS),
            AckPolicy::Never => None,
            AckPolicy::Fail(code) => Some(code),
            AckPolicy::Delayed(delay) => {
                thread::sleep(delay);
                Some(OPERATION_SUCCESS)
            }
            AckPolicy::NeverFor(target) if target == operation => None,
            AckPolicy::FailFor(target, code) if target == operation => Some(code),
            AckPolicy::NeverFor(_) | AckPolicy::FailFor(..) => Some(OPERATION_SUCCESS),
        }
    }

    fn run(&self, jobs: Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            match job {
                Job::Ack(operation) => {
                    if let Some(result) = self.ack_result(operation) {
                        self.notify(operation, result);
                    }
                }
                Job::Consume => {
                    if !self.is_running() {
                        continue;
                    }
                    if self.consume_span() {
                        self.notify(Operation::UpdateStream, OPERATION_SUCCESS);
                    } else {
                        self.notify(Operation::BufferUnderrun, OPERATION_SUCCESS);
                    }
                }
                Job::Flush => {
                    if self.role == StreamRole::Renderer {
                        let pending = self.ring.available_data_frames();
                        if let Ok(read) = self.ring.advance_read(pending) {
                            self.ring.set_handle_info(read, now_ns());
                        }
                    }
                    if let Some(result) = self.ack_result(Operation::Flush) {
                        self.notify(Operation::Flush, result);
                    }
                }
                Job::Drain => {
                    if self.role == StreamRole::Renderer {
                        while self.consume_span() {}
                    }
                    if let Some(result) = self.ack_result(Operation::Drain) {
                        self.notify(Operation::Drain, result);
                    }
                }
                Job::Shutdown => break,
            }
        }
        debug!(session_id = self.session_id, "Loopback worker exited");
    }
}

/// One stream inside the loopback service
pub struct LoopbackStream {
    shared: Arc<LoopShared>,
    jobs: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackStream {
    fn spawn(
        session_id: u32,
        role: StreamRole,
        ring: Arc<SharedRingBuffer>,
        options: LoopbackOptions,
    ) -> Result<Arc<Self>, IpcError> {
        let shared = Arc::new(LoopShared {
            session_id,
            role,
            ring,
            options,
            alive: AtomicBool::new(true),
            controls: Mutex::new(Controls {
                running: false,
                rate: RenderRate::Normal,
                low_power_volume: 1.0,
                effect_mode: AudioEffectMode::Default,
                privacy: PrivacyType::Public,
            }),
            listener: Mutex::new(None),
            consumed: Mutex::new(Vec::new()),
            update_position_calls: AtomicU64::new(0),
        });

        let (jobs, rx) = unbounded();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("loopback-{session_id}"))
            .spawn(move || worker_shared.run(rx))
            .map_err(|e| IpcError::Io(e.to_string()))?;

        Ok(Arc::new(Self {
            shared,
            jobs,
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn check_alive(&self) -> Result<(), IpcError> {
        if self.shared.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(IpcError::RemoteDied)
        }
    }

    fn submit(&self, job: Job) -> Result<(), IpcError> {
        self.check_alive()?;
        self.jobs.send(job).map_err(|_| IpcError::RemoteDied)
    }

    pub fn session_id(&self) -> u32 {
        self.shared.session_id
    }

    pub fn ring(&self) -> Arc<SharedRingBuffer> {
        Arc::clone(&self.shared.ring)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Number of `update_position` notices received so far
    pub fn update_position_calls(&self) -> u64 {
        self.shared.update_position_calls.load(Ordering::SeqCst)
    }

    /// Bytes consumed from the ring since the last call
    pub fn take_consumed(&self) -> Vec<u8> {
        std::mem::take(&mut *self.shared.consumed.lock())
    }

    /// Consume up to `spans` spans right now, regardless of run state.
    /// Returns how many were consumed.
    pub fn consume_spans(&self, spans: usize) -> usize {
        let mut done = 0;
        while done < spans && self.shared.consume_span() {
            done += 1;
        }
        if done > 0 {
            self.shared.notify(Operation::UpdateStream, OPERATION_SUCCESS);
        }
        done
    }

    /// Produce captured audio: writes as many whole spans of `data` as fit
    /// and returns the number of bytes taken.
    pub fn push_capture(&self, data: &[u8]) -> Result<usize, BufferError> {
        let ring = &self.shared.ring;
        let span_bytes = ring.span_bytes();
        let span_frames = ring.span_frames() as u64;
        let mut taken = 0;
        for span in data.chunks_exact(span_bytes) {
            if ring.writable_frames() < span_frames {
                self.shared.notify(Operation::BufferOverflow, OPERATION_SUCCESS);
                break;
            }
            ring.write_span(ring.cur_write_frame(), span)?;
            let written = ring.advance_write(span_frames)?;
            ring.set_handle_info(written, now_ns());
            taken += span_bytes;
        }
        if taken > 0 {
            self.shared.notify(Operation::UpdateStream, OPERATION_SUCCESS);
        }
        Ok(taken)
    }
}

impl IpcStream for LoopbackStream {
    fn register_stream_listener(&self, listener: Arc<dyn StreamListener>) -> Result<(), IpcError> {
        self.check_alive()?;
        *self.shared.listener.lock() = Some(listener);
        Ok(())
    }

    fn resolve_buffer(&self) -> Result<Arc<SharedRingBuffer>, IpcError> {
        self.check_alive()?;
        Ok(self.ring())
    }

    fn update_position(&self) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.update_position_calls.fetch_add(1, Ordering::SeqCst);
        if self.shared.role == StreamRole::Renderer && self.shared.options.auto_consume {
            self.submit(Job::Consume)?;
        }
        Ok(())
    }

    fn start(&self) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().running = true;
        self.submit(Job::Ack(Operation::Start))
    }

    fn pause(&self) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().running = false;
        self.submit(Job::Ack(Operation::Pause))
    }

    fn stop(&self) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().running = false;
        self.submit(Job::Ack(Operation::Stop))
    }

    fn flush(&self) -> Result<(), IpcError> {
        self.submit(Job::Flush)
    }

    fn drain(&self) -> Result<(), IpcError> {
        self.submit(Job::Drain)
    }

    fn release(&self) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().running = false;
        self.submit(Job::Ack(Operation::Release))
    }

    fn get_audio_time(&self) -> Result<HandleInfo, IpcError> {
        self.check_alive()?;
        Ok(self.shared.ring.handle_info())
    }

    fn get_latency(&self) -> Result<u64, IpcError> {
        self.check_alive()?;
        Ok(self.shared.options.latency_us)
    }

    fn set_rate(&self, rate: RenderRate) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().rate = rate;
        Ok(())
    }

    fn get_rate(&self) -> Result<RenderRate, IpcError> {
        self.check_alive()?;
        Ok(self.shared.controls.lock().rate)
    }

    fn set_low_power_volume(&self, volume: f32) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().low_power_volume = volume;
        Ok(())
    }

    fn get_low_power_volume(&self) -> Result<f32, IpcError> {
        self.check_alive()?;
        Ok(self.shared.controls.lock().low_power_volume)
    }

    fn set_audio_effect_mode(&self, mode: AudioEffectMode) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().effect_mode = mode;
        Ok(())
    }

    fn get_audio_effect_mode(&self) -> Result<AudioEffectMode, IpcError> {
        self.check_alive()?;
        Ok(self.shared.controls.lock().effect_mode)
    }

    fn set_privacy_type(&self, privacy: PrivacyType) -> Result<(), IpcError> {
        self.check_alive()?;
        self.shared.controls.lock().privacy = privacy;
        Ok(())
    }

    fn get_privacy_type(&self) -> Result<PrivacyType, IpcError> {
        self.check_alive()?;
        Ok(self.shared.controls.lock().privacy)
    }
}

impl Drop for LoopbackStream {
    fn drop(&mut self) {
        let _ = self.jobs.send(Job::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::RecvTimeoutError;

    struct ChannelListener(Sender<(Operation, i64)>);

    impl StreamListener for ChannelListener {
        fn on_operation_handled(&self, operation: Operation, result: i64) {
            let _ = self.0.send((operation, result));
        }
    }

    fn setup(options: LoopbackOptions) -> (Arc<LoopbackService>, StreamHandle, Receiver<(Operation, i64)>) {
        let service = LoopbackService::new(options);
        let handle = service
            .create_stream(&StreamConfig::default(), StreamRole::Renderer)
            .unwrap();
        let (tx, rx) = unbounded();
        handle
            .stream
            .register_stream_listener(Arc::new(ChannelListener(tx)))
            .unwrap();
        (service, handle, rx)
    }

    #[test]
    fn test_geometry_from_sample_rate() {
        let (_service, handle, _rx) = setup(LoopbackOptions::default());
        let ring = handle.stream.resolve_buffer().unwrap();
        assert_eq!(ring.span_frames(), 960);
        assert_eq!(ring.total_frames(), 960 * 4);
        assert_eq!(ring.bytes_per_frame(), 4);
        assert!(handle.session_id >= FIRST_SESSION_ID);
    }

    #[test]
    fn test_acks_follow_policy() {
        let (_service, handle, rx) = setup(LoopbackOptions::default());
        handle.stream.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Start, 0)));

        let (_service, handle, rx) = setup(LoopbackOptions {
            ack_policy: AckPolicy::Fail(7),
            ..LoopbackOptions::default()
        });
        handle.stream.pause().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Pause, 7)));

        let (_service, handle, rx) = setup(LoopbackOptions {
            ack_policy: AckPolicy::Never,
            ..LoopbackOptions::default()
        });
        handle.stream.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_per_operation_policy_only_hits_its_target() {
        let (_service, handle, rx) = setup(LoopbackOptions {
            ack_policy: AckPolicy::FailFor(Operation::Stop, -5),
            ..LoopbackOptions::default()
        });
        handle.stream.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Start, 0)));
        handle.stream.stop().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Stop, -5)));

        let (_service, handle, rx) = setup(LoopbackOptions {
            ack_policy: AckPolicy::NeverFor(Operation::Stop),
            ..LoopbackOptions::default()
        });
        handle.stream.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Start, 0)));
        handle.stream.stop().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn test_consumes_span_on_update() {
        let (service, handle, rx) = setup(LoopbackOptions {
            span_frames: Some(240),
            ..LoopbackOptions::default()
        });
        let ring = handle.stream.resolve_buffer().unwrap();
        handle.stream.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok((Operation::Start, 0)));

        let span = vec![3u8; ring.span_bytes()];
        ring.write_span(0, &span).unwrap();
        ring.advance_write(240).unwrap();
        handle.stream.update_position().unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)),
            Ok((Operation::UpdateStream, 0))
        );
        let stream = service.last_stream().unwrap();
        assert_eq!(stream.update_position_calls(), 1);
        assert_eq!(stream.take_consumed(), span);
        assert_eq!(ring.handle_info().frame_position, 240);
    }

    #[test]
    fn test_killed_service_reports_death() {
        let (service, handle, _rx) = setup(LoopbackOptions::default());
        service.kill();
        assert!(!service.is_alive());
        assert_eq!(handle.stream.start(), Err(IpcError::RemoteDied));
        assert!(service
            .create_stream(&StreamConfig::default(), StreamRole::Renderer)
            .is_err());
    }
}
