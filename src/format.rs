//! Stream format legality predicates
//!
//! Pure functions deciding which `(rate, channels, format, encoding)`
//! combinations a stream may be opened with. Checked before any IPC or
//! allocation happens.

use serde::{Deserialize, Serialize};

use crate::config::{StreamConfig, StreamRole};
use crate::error::StreamError;

/// PCM sample layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16Le,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le | SampleFormat::F32Le => 4,
        }
    }
}

/// Stream encoding. Only PCM is carried through the shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Pcm,
    Invalid,
}

/// Speaker arrangement. `Unknown` means "derive from the channel count".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelLayout {
    Unknown,
    Mono,
    Stereo,
    Surround2Point1,
    Quad,
    Surround5Point1,
    Surround7Point1,
}

impl ChannelLayout {
    pub fn channel_count(self) -> Option<u16> {
        match self {
            ChannelLayout::Unknown => None,
            ChannelLayout::Mono => Some(1),
            ChannelLayout::Stereo => Some(2),
            ChannelLayout::Surround2Point1 => Some(3),
            ChannelLayout::Quad => Some(4),
            ChannelLayout::Surround5Point1 => Some(6),
            ChannelLayout::Surround7Point1 => Some(8),
        }
    }
}

pub const SUPPORTED_SAMPLE_RATES: [u32; 11] = [
    8000, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 96000,
];

pub const SUPPORTED_FORMATS: [SampleFormat; 4] = [
    SampleFormat::U8,
    SampleFormat::S16Le,
    SampleFormat::S24Le,
    SampleFormat::S32Le,
];

pub const RENDERER_MAX_CHANNELS: u16 = 8;
pub const CAPTURER_MAX_CHANNELS: u16 = 6;

pub fn is_format_valid(format: SampleFormat) -> bool {
    SUPPORTED_FORMATS.contains(&format)
}

pub fn is_sampling_rate_valid(rate: u32) -> bool {
    SUPPORTED_SAMPLE_RATES.contains(&rate)
}

pub fn is_encoding_valid(encoding: Encoding) -> bool {
    encoding == Encoding::Pcm
}

fn is_layout_consistent(channels: u16, layout: ChannelLayout) -> bool {
    layout.channel_count().map_or(true, |count| count == channels)
}

pub fn is_renderer_channel_valid(channels: u16, layout: ChannelLayout) -> bool {
    (1..=RENDERER_MAX_CHANNELS).contains(&channels) && is_layout_consistent(channels, layout)
}

pub fn is_capturer_channel_valid(channels: u16, layout: ChannelLayout) -> bool {
    (1..=CAPTURER_MAX_CHANNELS).contains(&channels) && is_layout_consistent(channels, layout)
}

/// Reject an unusable stream configuration with a parameter error.
pub fn validate(config: &StreamConfig, role: StreamRole) -> Result<(), StreamError> {
    if !is_format_valid(config.format) {
        return Err(StreamError::InvalidParameter(format!(
            "unsupported sample format {:?}",
            config.format
        )));
    }
    if !is_sampling_rate_valid(config.sample_rate) {
        return Err(StreamError::InvalidParameter(format!(
            "unsupported sample rate {}",
            config.sample_rate
        )));
    }
    if !is_encoding_valid(config.encoding) {
        return Err(StreamError::InvalidParameter(format!(
            "unsupported encoding {:?}",
            config.encoding
        )));
    }
    let channels_ok = match role {
        StreamRole::Renderer => is_renderer_channel_valid(config.channels, config.channel_layout),
        StreamRole::Capturer => is_capturer_channel_valid(config.channels, config.channel_layout),
    };
    if !channels_ok {
        return Err(StreamError::InvalidParameter(format!(
            "unsupported channels {} with layout {:?} for {:?}",
            config.channels, config.channel_layout, role
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_sample() {
        assert_eq!(SampleFormat::U8.bytes_per_sample(), 1);
        assert_eq!(SampleFormat::S24Le.bytes_per_sample(), 3);
        assert_eq!(SampleFormat::F32Le.bytes_per_sample(), 4);
    }

    #[test]
    fn test_channel_limits_differ_by_role() {
        assert!(is_renderer_channel_valid(8, ChannelLayout::Unknown));
        assert!(!is_capturer_channel_valid(8, ChannelLayout::Unknown));
        assert!(!is_renderer_channel_valid(0, ChannelLayout::Unknown));
        assert!(!is_renderer_channel_valid(2, ChannelLayout::Surround5Point1));
    }

    #[test]
    fn test_validate_rejects_float_and_odd_rates() {
        let mut config = StreamConfig::playback(48000, 2, SampleFormat::F32Le);
        assert!(validate(&config, StreamRole::Renderer).is_err());

        config.format = SampleFormat::S16Le;
        config.sample_rate = 47999;
        assert!(validate(&config, StreamRole::Renderer).is_err());

        config.sample_rate = 44100;
        assert!(validate(&config, StreamRole::Renderer).is_ok());
    }
}
