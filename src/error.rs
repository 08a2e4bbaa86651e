//! Error types for the stream client

use thiserror::Error;

use crate::stream::StreamState;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared ring buffer and ring cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid buffer geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid cache size: {0}")]
    InvalidCacheSize(usize),

    #[error("Insufficient space: requested {requested} bytes, {available} writable")]
    InsufficientSpace { requested: usize, available: usize },

    #[error("Insufficient data: requested {requested} bytes, {available} readable")]
    InsufficientData { requested: usize, available: usize },

    #[error("Frame range {start}..{end} outside {low}..{high}")]
    OutOfRange { start: u64, end: u64, low: u64, high: u64 },

    #[error("Cursor advance by {delta} frames exceeds {limit}")]
    AdvanceOverflow { delta: u64, limit: u64 },

    #[error("Length {0} is not a whole number of frames")]
    UnalignedLength(usize),

    #[error("Shared buffer header mismatch: {0}")]
    HeaderMismatch(String),

    #[error("Mapping failed: {0}")]
    Map(String),
}

/// IPC channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    #[error("Audio service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Remote died")]
    RemoteDied,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("{0} cancelled")]
    Cancelled(&'static str),

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Io(String),
}

/// Client-facing stream errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{operation} not allowed in state {state:?}")]
    IllegalState { operation: &'static str, state: StreamState },

    #[error("{operation} timed out after {timeout_ms} ms")]
    RemoteTimeout { operation: &'static str, timeout_ms: u64 },

    #[error("{operation} failed remotely with code {code}")]
    RemoteFailure { operation: &'static str, code: i64 },

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

impl StreamError {
    /// Negative status code for callers that want the signed byte-count
    /// convention. Never collides with a valid (non-negative) count.
    pub fn code(&self) -> i32 {
        match self {
            StreamError::InvalidParameter(_) => -1,
            StreamError::IllegalState { .. } => -2,
            StreamError::RemoteTimeout { .. } => -3,
            StreamError::RemoteFailure { .. } => -4,
            StreamError::Resource(_) => -5,
            StreamError::Ipc(_) => -6,
        }
    }

    pub(crate) fn illegal(operation: &'static str, state: StreamState) -> Self {
        StreamError::IllegalState { operation, state }
    }
}

impl From<BufferError> for StreamError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::UnalignedLength(_) => StreamError::InvalidParameter(err.to_string()),
            other => StreamError::Resource(other.to_string()),
        }
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let errors = [
            StreamError::InvalidParameter("x".into()),
            StreamError::illegal("write", StreamState::Released),
            StreamError::RemoteTimeout { operation: "start", timeout_ms: 500 },
            StreamError::RemoteFailure { operation: "stop", code: 3 },
            StreamError::Resource("x".into()),
            StreamError::Ipc(IpcError::RemoteDied),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_buffer_error_conversion() {
        let err: StreamError = BufferError::UnalignedLength(3).into();
        assert!(matches!(err, StreamError::InvalidParameter(_)));

        let err: StreamError = BufferError::InvalidCacheSize(0).into();
        assert!(matches!(err, StreamError::Resource(_)));
    }
}
