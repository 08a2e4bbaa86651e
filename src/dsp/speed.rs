//! Playback speed change
//!
//! Output size differs from input size, so transforms append to a caller
//! owned buffer and carry their fractional read position across calls.

use crate::error::StreamError;
use crate::format::SampleFormat;

use super::{decode, encode_into};

pub const MIN_SPEED: f32 = 0.25;
pub const MAX_SPEED: f32 = 4.0;

pub fn check_speed(speed: f32) -> Result<(), StreamError> {
    if !(MIN_SPEED..=MAX_SPEED).contains(&speed) {
        return Err(StreamError::InvalidParameter(format!(
            "speed {speed} outside {MIN_SPEED}..={MAX_SPEED}"
        )));
    }
    Ok(())
}

pub trait SpeedTransform: Send {
    fn set_speed(&mut self, speed: f32) -> Result<(), StreamError>;

    fn speed(&self) -> f32;

    /// Transform `input` (whole frames) and append the result to `output`.
    /// Returns the number of bytes appended.
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize;

    /// Forget carried state (after a flush)
    fn reset(&mut self);
}

/// Resampling by linear interpolation. Changes pitch along with tempo.
pub struct LinearSpeed {
    format: SampleFormat,
    channels: usize,
    speed: f32,
    /// Read position relative to the carried frame
    phase: f64,
    carry: Vec<f32>,
}

impl LinearSpeed {
    pub fn new(format: SampleFormat, channels: usize) -> Self {
        Self {
            format,
            channels: channels.max(1),
            speed: 1.0,
            phase: 0.0,
            carry: Vec::new(),
        }
    }
}

impl SpeedTransform for LinearSpeed {
    fn set_speed(&mut self, speed: f32) -> Result<(), StreamError> {
        check_speed(speed)?;
        self.speed = speed;
        Ok(())
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize {
        let channels = self.channels;
        let decoded = decode(self.format, input);
        let frames = decoded.len() / channels;
        if frames == 0 {
            return 0;
        }

        // frame 0 is the last frame of the previous call
        let mut samples = if self.carry.len() == channels {
            std::mem::take(&mut self.carry)
        } else {
            decoded[..channels].to_vec()
        };
        samples.extend_from_slice(&decoded[..frames * channels]);
        let total = frames + 1;

        let mut out = Vec::new();
        while (self.phase as usize) + 1 < total {
            let index = self.phase as usize;
            let frac = (self.phase - index as f64) as f32;
            let a = &samples[index * channels..(index + 1) * channels];
            let b = &samples[(index + 1) * channels..(index + 2) * channels];
            out.extend(a.iter().zip(b).map(|(x, y)| x + (y - x) * frac));
            self.phase += self.speed as f64;
        }
        self.phase -= frames as f64;
        self.carry = samples[frames * channels..].to_vec();

        let before = output.len();
        encode_into(self.format, &out, output);
        output.len() - before
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.carry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| ((i * 100) as i16).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_speed_range() {
        let mut speed = LinearSpeed::new(SampleFormat::S16Le, 1);
        assert!(speed.set_speed(0.1).is_err());
        assert!(speed.set_speed(5.0).is_err());
        assert!(speed.set_speed(2.0).is_ok());
        assert_eq!(speed.speed(), 2.0);
    }

    #[test]
    fn test_output_length_scales() {
        let mut fast = LinearSpeed::new(SampleFormat::S16Le, 1);
        fast.set_speed(2.0).unwrap();
        let mut slow = LinearSpeed::new(SampleFormat::S16Le, 1);
        slow.set_speed(0.5).unwrap();

        let mut fast_out = Vec::new();
        let mut slow_out = Vec::new();
        for _ in 0..10 {
            fast.process(&ramp(100), &mut fast_out);
            slow.process(&ramp(100), &mut slow_out);
        }
        // 1000 input frames of 2 bytes
        assert!((fast_out.len() as i64 - 1000).abs() <= 4);
        assert!((slow_out.len() as i64 - 4000).abs() <= 4);
    }

    #[test]
    fn test_unit_speed_preserves_frames() {
        let mut speed = LinearSpeed::new(SampleFormat::S16Le, 2);
        let input = ramp(64);
        let mut out = Vec::new();
        assert_eq!(speed.process(&input, &mut out), input.len());
        speed.reset();
        out.clear();
        assert_eq!(speed.process(&input, &mut out), input.len());
    }
}
