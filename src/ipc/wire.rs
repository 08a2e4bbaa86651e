//! Framed control channel over any byte stream
//!
//! Frames are a 4-byte little-endian length followed by a `bincode`
//! encoded [`Message`]. One connection carries one stream: the first request
//! is `CreateStream`, after which requests map one-to-one onto
//! [`IpcStream`] calls. Acks and notices travel back as `Notify` messages.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::protocol::{AudioEffectMode, Operation, PrivacyType, RenderRate};
use super::service::{AudioService, IpcStream, StreamHandle, StreamListener};
use crate::buffer::{HandleInfo, SharedRingBuffer};
use crate::config::{StreamConfig, StreamRole};
use crate::error::IpcError;

/// Frames above this size are rejected as corrupt
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    CreateStream { config: StreamConfig, role: StreamRole },
    ResolveBuffer,
    UpdatePosition,
    Start,
    Pause,
    Stop,
    Flush,
    Drain,
    Release,
    GetAudioTime,
    GetLatency,
    SetRate(RenderRate),
    GetRate,
    SetLowPowerVolume(f32),
    GetLowPowerVolume,
    SetAudioEffectMode(AudioEffectMode),
    GetAudioEffectMode,
    SetPrivacyType(PrivacyType),
    GetPrivacyType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Ok,
    Created { session_id: u32 },
    Buffer { path: PathBuf },
    AudioTime(HandleInfo),
    Latency(u64),
    Rate(RenderRate),
    Volume(f32),
    EffectMode(AudioEffectMode),
    Privacy(PrivacyType),
    Err { code: i32, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request { seq: u64, request: Request },
    Reply { seq: u64, reply: Reply },
    Notify { operation: Operation, result: i64 },
}

pub fn write_message<W: Write>(mut w: W, msg: &Message) -> Result<(), IpcError> {
    let payload = bincode::serialize(msg).map_err(|e| IpcError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(IpcError::Codec(format!("frame of {} bytes too large", payload.len())));
    }
    let len = payload.len() as u32;
    w.write_all(&len.to_le_bytes())
        .and_then(|_| w.write_all(&payload))
        .and_then(|_| w.flush())
        .map_err(|e| IpcError::Io(e.to_string()))
}

/// Read one frame. `Ok(None)` on a clean end of stream.
pub fn read_message<R: Read>(mut r: R) -> Result<Option<Message>, IpcError> {
    let mut len_bytes = [0u8; 4];
    match r.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(IpcError::Io(e.to_string())),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(IpcError::Codec(format!("frame of {len} bytes too large")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .map_err(|e| IpcError::Io(e.to_string()))?;
    bincode::deserialize(&payload)
        .map(Some)
        .map_err(|e| IpcError::Codec(e.to_string()))
}

pub type BoxedReader = Box<dyn Read + Send>;
pub type BoxedWriter = Box<dyn Write + Send>;

struct FramedShared {
    replies: DashMap<u64, Sender<Reply>>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    alive: AtomicBool,
}

impl FramedShared {
    fn read_loop(&self, mut reader: BoxedReader) {
        loop {
            match read_message(&mut reader) {
                Ok(Some(Message::Reply { seq, reply })) => match self.replies.remove(&seq) {
                    Some((_, tx)) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(seq, "Reply for abandoned request"),
                },
                Ok(Some(Message::Notify { operation, result })) => {
                    let listener = self.listener.lock().clone();
                    if let Some(listener) = listener {
                        listener.on_operation_handled(operation, result);
                    }
                }
                Ok(Some(Message::Request { seq, .. })) => {
                    warn!(seq, "Ignoring request sent to client side");
                }
                Ok(None) => {
                    info!("Service closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Control channel read failed: {}", e);
                    break;
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        // dropping the senders fails every outstanding call with RemoteDied
        self.replies.clear();
    }
}

/// Client end of a framed connection
pub struct FramedStream {
    writer: Mutex<BoxedWriter>,
    shared: Arc<FramedShared>,
    next_seq: AtomicU64,
    timeout: Duration,
}

impl FramedStream {
    /// Start the reader thread and open a stream on the far side.
    pub fn connect(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: &StreamConfig,
        role: StreamRole,
        timeout: Duration,
    ) -> Result<StreamHandle, IpcError> {
        let shared = Arc::new(FramedShared {
            replies: DashMap::new(),
            listener: Mutex::new(None),
            alive: AtomicBool::new(true),
        });
        let reader_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("ipc-reader".into())
            .spawn(move || reader_shared.read_loop(reader))
            .map_err(|e| IpcError::Io(e.to_string()))?;

        let stream = Arc::new(Self {
            writer: Mutex::new(writer),
            shared,
            next_seq: AtomicU64::new(1),
            timeout,
        });
        let request = Request::CreateStream {
            config: config.clone(),
            role,
        };
        match stream.call(request)? {
            Reply::Created { session_id } => Ok(StreamHandle {
                stream,
                session_id,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    fn call(&self, request: Request) -> Result<Reply, IpcError> {
        if !self.is_alive() {
            return Err(IpcError::RemoteDied);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.shared.replies.insert(seq, tx);
        if !self.is_alive() {
            self.shared.replies.remove(&seq);
            return Err(IpcError::RemoteDied);
        }

        let sent = write_message(&mut *self.writer.lock(), &Message::Request { seq, request });
        if let Err(e) = sent {
            self.shared.replies.remove(&seq);
            return Err(e);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Reply::Err { code, message }) => Err(IpcError::Remote { code, message }),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.shared.replies.remove(&seq);
                Err(IpcError::Timeout("request"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(IpcError::RemoteDied),
        }
    }

    fn call_ok(&self, request: Request) -> Result<(), IpcError> {
        match self.call(request)? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> IpcError {
    IpcError::UnexpectedReply(format!("{reply:?}"))
}

impl IpcStream for FramedStream {
    fn register_stream_listener(&self, listener: Arc<dyn StreamListener>) -> Result<(), IpcError> {
        *self.shared.listener.lock() = Some(listener);
        Ok(())
    }

    fn resolve_buffer(&self) -> Result<Arc<SharedRingBuffer>, IpcError> {
        match self.call(Request::ResolveBuffer)? {
            Reply::Buffer { path } => SharedRingBuffer::open(&path)
                .map(Arc::new)
                .map_err(|e| IpcError::Io(e.to_string())),
            other => Err(unexpected(other)),
        }
    }

    fn update_position(&self) -> Result<(), IpcError> {
        self.call_ok(Request::UpdatePosition)
    }

    fn start(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Start)
    }

    fn pause(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Pause)
    }

    fn stop(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Stop)
    }

    fn flush(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Flush)
    }

    fn drain(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Drain)
    }

    fn release(&self) -> Result<(), IpcError> {
        self.call_ok(Request::Release)
    }

    fn get_audio_time(&self) -> Result<HandleInfo, IpcError> {
        match self.call(Request::GetAudioTime)? {
            Reply::AudioTime(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    fn get_latency(&self) -> Result<u64, IpcError> {
        match self.call(Request::GetLatency)? {
            Reply::Latency(us) => Ok(us),
            other => Err(unexpected(other)),
        }
    }

    fn set_rate(&self, rate: RenderRate) -> Result<(), IpcError> {
        self.call_ok(Request::SetRate(rate))
    }

    fn get_rate(&self) -> Result<RenderRate, IpcError> {
        match self.call(Request::GetRate)? {
            Reply::Rate(rate) => Ok(rate),
            other => Err(unexpected(other)),
        }
    }

    fn set_low_power_volume(&self, volume: f32) -> Result<(), IpcError> {
        self.call_ok(Request::SetLowPowerVolume(volume))
    }

    fn get_low_power_volume(&self) -> Result<f32, IpcError> {
        match self.call(Request::GetLowPowerVolume)? {
            Reply::Volume(volume) => Ok(volume),
            other => Err(unexpected(other)),
        }
    }

    fn set_audio_effect_mode(&self, mode: AudioEffectMode) -> Result<(), IpcError> {
        self.call_ok(Request::SetAudioEffectMode(mode))
    }

    fn get_audio_effect_mode(&self) -> Result<AudioEffectMode, IpcError> {
        match self.call(Request::GetAudioEffectMode)? {
            Reply::EffectMode(mode) => Ok(mode),
            other => Err(unexpected(other)),
        }
    }

    fn set_privacy_type(&self, privacy: PrivacyType) -> Result<(), IpcError> {
        self.call_ok(Request::SetPrivacyType(privacy))
    }

    fn get_privacy_type(&self) -> Result<PrivacyType, IpcError> {
        match self.call(Request::GetPrivacyType)? {
            Reply::Privacy(privacy) => Ok(privacy),
            other => Err(unexpected(other)),
        }
    }
}

type Dialer = Box<dyn Fn() -> io::Result<(BoxedReader, BoxedWriter)> + Send + Sync>;

/// [`AudioService`] that opens one framed connection per stream
pub struct WireService {
    dial: Dialer,
    timeout: Duration,
    alive: AtomicBool,
}

impl WireService {
    pub fn new<F>(dial: F, timeout: Duration) -> Self
    where
        F: Fn() -> io::Result<(BoxedReader, BoxedWriter)> + Send + Sync + 'static,
    {
        Self {
            dial: Box::new(dial),
            timeout,
            alive: AtomicBool::new(true),
        }
    }
}

impl AudioService for WireService {
    fn create_stream(&self, config: &StreamConfig, role: StreamRole) -> Result<StreamHandle, IpcError> {
        let (reader, writer) = (self.dial)().map_err(|e| {
            self.alive.store(false, Ordering::SeqCst);
            IpcError::ServiceUnavailable(e.to_string())
        })?;
        FramedStream::connect(reader, writer, config, role, self.timeout)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Forwards acks from the served stream back over the connection
struct NotifyForwarder {
    writer: Arc<Mutex<BoxedWriter>>,
}

impl StreamListener for NotifyForwarder {
    fn on_operation_handled(&self, operation: Operation, result: i64) {
        let msg = Message::Notify { operation, result };
        if let Err(e) = write_message(&mut *self.writer.lock(), &msg) {
            debug!(operation = %operation, "Dropping notice: {}", e);
        }
    }
}

fn error_reply(err: IpcError) -> Reply {
    let code = match err {
        IpcError::Remote { code, .. } => code,
        _ => -1,
    };
    Reply::Err {
        code,
        message: err.to_string(),
    }
}

fn dispatch(stream: &dyn IpcStream, request: Request) -> Result<Reply, IpcError> {
    let ok = |r: Result<(), IpcError>| r.map(|_| Reply::Ok);
    match request {
        Request::CreateStream { .. } => Err(IpcError::UnexpectedReply("stream already created".into())),
        Request::ResolveBuffer => {
            let ring = stream.resolve_buffer()?;
            let path = ring
                .path()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| IpcError::ServiceUnavailable("buffer is not shareable".into()))?;
            Ok(Reply::Buffer { path })
        }
        Request::UpdatePosition => ok(stream.update_position()),
        Request::Start => ok(stream.start()),
        Request::Pause => ok(stream.pause()),
        Request::Stop => ok(stream.stop()),
        Request::Flush => ok(stream.flush()),
        Request::Drain => ok(stream.drain()),
        Request::Release => ok(stream.release()),
        Request::GetAudioTime => stream.get_audio_time().map(Reply::AudioTime),
        Request::GetLatency => stream.get_latency().map(Reply::Latency),
        Request::SetRate(rate) => ok(stream.set_rate(rate)),
        Request::GetRate => stream.get_rate().map(Reply::Rate),
        Request::SetLowPowerVolume(v) => ok(stream.set_low_power_volume(v)),
        Request::GetLowPowerVolume => stream.get_low_power_volume().map(Reply::Volume),
        Request::SetAudioEffectMode(m) => ok(stream.set_audio_effect_mode(m)),
        Request::GetAudioEffectMode => stream.get_audio_effect_mode().map(Reply::EffectMode),
        Request::SetPrivacyType(p) => ok(stream.set_privacy_type(p)),
        Request::GetPrivacyType => stream.get_privacy_type().map(Reply::Privacy),
    }
}

/// Serve one connection against `service` until the peer hangs up.
pub fn serve(
    mut reader: BoxedReader,
    writer: BoxedWriter,
    service: Arc<dyn AudioService>,
) -> Result<(), IpcError> {
    let writer = Arc::new(Mutex::new(writer));
    let mut stream: Option<Arc<dyn IpcStream>> = None;

    while let Some(msg) = read_message(&mut reader)? {
        let (seq, request) = match msg {
            Message::Request { seq, request } => (seq, request),
            other => {
                warn!("Ignoring non-request message: {:?}", other);
                continue;
            }
        };

        let reply = match request {
            Request::CreateStream { config, role } if stream.is_none() => {
                match service.create_stream(&config, role) {
                    Ok(handle) => {
                        let forwarder = Arc::new(NotifyForwarder {
                            writer: Arc::clone(&writer),
                        });
                        match handle.stream.register_stream_listener(forwarder) {
                            Ok(()) => {
                                stream = Some(handle.stream);
                                Reply::Created {
                                    session_id: handle.session_id,
                                }
                            }
                            Err(e) => error_reply(e),
                        }
                    }
                    Err(e) => error_reply(e),
                }
            }
            request => match &stream {
                Some(active) => dispatch(active.as_ref(), request).unwrap_or_else(error_reply),
                None => error_reply(IpcError::ServiceUnavailable("no stream created".into())),
            },
        };
        write_message(&mut *writer.lock(), &Message::Reply { seq, reply })?;
    }
    info!("Client closed the connection");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_roundtrip_and_clean_eof() {
        let mut buf = Vec::new();
        let msg = Message::Notify {
            operation: Operation::Drain,
            result: -3,
        };
        write_message(&mut buf, &msg).unwrap();
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize, buf.len() - 4);

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_message(&mut cursor).unwrap(), Some(msg));
        assert_eq!(read_message(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = ((MAX_FRAME_BYTES + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 16]);
        assert!(matches!(
            read_message(Cursor::new(buf)),
            Err(IpcError::Codec(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(read_message(Cursor::new(buf)), Err(IpcError::Io(_))));
    }
}
