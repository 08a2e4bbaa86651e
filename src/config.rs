//! Stream and client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Error;
use crate::format::{ChannelLayout, Encoding, SampleFormat};

/// Direction of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamRole {
    Renderer,
    Capturer,
}

/// What the stream is used for. Forwarded to the service for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamUsage {
    Unknown,
    Media,
    VoiceCommunication,
    VoiceAssistant,
    Alarm,
    Ringtone,
    Notification,
    Game,
    Navigation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    Unknown,
    Speech,
    Music,
    Movie,
    Sonification,
}

/// Parameters a stream is opened with. Copied into the client on setup and
/// never changed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub channel_layout: ChannelLayout,
    pub format: SampleFormat,
    pub encoding: Encoding,
    pub usage: StreamUsage,
    pub content_type: ContentType,
    pub flags: u32,
}

impl StreamConfig {
    pub fn playback(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            channel_layout: ChannelLayout::Unknown,
            format,
            encoding: Encoding::Pcm,
            usage: StreamUsage::Media,
            content_type: ContentType::Music,
            flags: 0,
        }
    }

    pub fn capture(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            usage: StreamUsage::VoiceCommunication,
            content_type: ContentType::Speech,
            ..Self::playback(sample_rate, channels, format)
        }
    }

    /// `channels × bytes_per_sample`
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::playback(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, SampleFormat::S16Le)
    }
}

/// Client-side tuning: timeouts and buffer sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Ack timeout for Start/Pause/Stop/Flush/Drain/Release
    pub operation_timeout_ms: u64,
    /// Ack timeout used instead while offload mode is on
    pub offload_timeout_ms: u64,
    /// Bound for pushing the cache remainder before a drain
    pub drain_cache_timeout_ms: u64,
    /// Wait for a free span on write
    pub write_timeout_ms: u64,
    /// Wait for a filled span on blocking read
    pub read_timeout_ms: u64,
    /// Ring cache capacity in spans (1..=4)
    pub cache_spans: usize,
    /// Pull-mode queue depth
    pub pull_queue_capacity: usize,
    /// Bounded join for worker threads
    pub worker_join_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: OPERATION_TIMEOUT_MS,
            offload_timeout_ms: OFFLOAD_OPERATION_TIMEOUT_MS,
            drain_cache_timeout_ms: DRAIN_CACHE_TIMEOUT_MS,
            write_timeout_ms: WRITE_BUFFER_TIMEOUT_MS,
            read_timeout_ms: READ_BUFFER_TIMEOUT_MS,
            cache_spans: 2,
            pull_queue_capacity: PULL_QUEUE_CAPACITY,
            worker_join_timeout_ms: WORKER_JOIN_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file; missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: ClientConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the per-user config location, or defaults when absent.
    pub fn load_or_default() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading client config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "audio-stream-client")
            .map(|dirs| dirs.config_dir().join("client.toml"))
    }

    pub fn to_toml(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(MIN_CACHE_SPANS..=MAX_CACHE_SPANS).contains(&self.cache_spans) {
            return Err(Error::Config(format!(
                "cache_spans must be within {}..={}, got {}",
                MIN_CACHE_SPANS, MAX_CACHE_SPANS, self.cache_spans
            )));
        }
        if self.pull_queue_capacity == 0 {
            return Err(Error::Config("pull_queue_capacity must be non-zero".into()));
        }
        if self.operation_timeout_ms == 0 || self.offload_timeout_ms == 0 {
            return Err(Error::Config("operation timeouts must be non-zero".into()));
        }
        Ok(())
    }

    pub fn operation_timeout(&self, offload: bool) -> Duration {
        if offload {
            Duration::from_millis(self.offload_timeout_ms)
        } else {
            Duration::from_millis(self.operation_timeout_ms)
        }
    }

    pub fn drain_cache_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_cache_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }
}
