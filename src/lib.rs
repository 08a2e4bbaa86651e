//! # Audio Stream Client
//!
//! Client-side streaming engine for audio playback and capture against an
//! out-of-process audio service.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              CLIENT PROCESS                                  │
//! │                                                                              │
//! │   caller threads            pull worker (callback mode only)                 │
//! │        │  write/read              │                                          │
//! │        ▼                          ▼                                          │
//! │  ┌─────────────────────────────────────────────────────────────────────┐    │
//! │  │           Stream Client (stream::renderer / stream::capturer)        │    │
//! │  │   lifecycle state machine ── volume/blend/speed ── position tracker  │    │
//! │  └───────┬──────────────────────────┬──────────────────────────┬───────┘    │
//! │          │ bytes                    │ control ops              │ events     │
//! │          ▼                          ▼                          ▼            │
//! │  ┌───────────────┐        ┌──────────────────┐        ┌─────────────────┐   │
//! │  │  Ring Cache   │        │ IPC Stream       │        │ Callback        │   │
//! │  │ (buffer::     │        │ Channel (ipc)    │        │ Dispatch thread │   │
//! │  │  cache)       │        │ pending op table │        │ (dispatch)      │   │
//! │  └──────┬────────┘        └────────┬─────────┘        └─────────────────┘   │
//! │         │ whole spans              │ requests   ▲ (operation, result)       │
//! └─────────┼──────────────────────────┼────────────┼───────────────────────────┘
//!           ▼                          ▼            │
//! ┌─────────────────────────────────────────────────┴───────────────────────────┐
//! │  Shared Ring Buffer (buffer::shared, mmap)      │     AUDIO SERVICE          │
//! │  [span 0][span 1][span 2][span 3]  write/read   │  consumes / produces spans │
//! │  cursors advance by delta only                  │  acks via stream listener  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod dsp;
pub mod error;
pub mod format;
pub mod ipc;
pub mod stream;

pub use config::{ClientConfig, StreamConfig, StreamRole};
pub use error::{Error, Result};
pub use stream::{CapturerInClient, RendererInClient, StreamState};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Ack timeout for control operations
    pub const OPERATION_TIMEOUT_MS: u64 = 500;

    /// Ack timeout for control operations while in offload mode
    pub const OFFLOAD_OPERATION_TIMEOUT_MS: u64 = 8000;

    /// Upper bound for pushing the cache remainder out before a drain
    pub const DRAIN_CACHE_TIMEOUT_MS: u64 = 3000;

    /// Wait for a free span in the shared buffer on write
    pub const WRITE_BUFFER_TIMEOUT_MS: u64 = 1000;

    /// Wait for a filled span in the shared buffer on blocking read
    pub const READ_BUFFER_TIMEOUT_MS: u64 = 5000;

    /// Bounded join for stream worker threads
    pub const WORKER_JOIN_TIMEOUT_MS: u64 = 1000;

    /// Pull-mode buffer queue depth
    pub const PULL_QUEUE_CAPACITY: usize = 3;

    /// Ring cache capacity bounds, in spans
    pub const MIN_CACHE_SPANS: usize = 1;
    pub const MAX_CACHE_SPANS: usize = 4;

    /// Hard ceiling for a ring cache allocation
    pub const MAX_CACHE_SIZE: usize = 16 * 1024 * 1024;

    /// Default span length negotiated by the service
    pub const DEFAULT_SPAN_DURATION_MS: u32 = 20;

    /// Spans per shared ring buffer
    pub const SHARED_BUFFER_SPANS: u32 = 4;

    /// Sanity limit for a shared ring buffer data region
    pub const MAX_SHARED_BUFFER_BYTES: u64 = 64 * 1024 * 1024;
}
