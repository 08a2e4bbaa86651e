//! Software volume with linear ramps

use crate::error::StreamError;
use crate::format::SampleFormat;

use super::{read_sample, write_sample};

pub const MIN_VOLUME: f32 = 0.0;
pub const MAX_VOLUME: f32 = 1.0;

/// Linear gain change spread over a number of frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeRamp {
    start: f32,
    end: f32,
    total_frames: u64,
    done_frames: u64,
}

impl VolumeRamp {
    pub fn new(start: f32, end: f32, total_frames: u64) -> Self {
        Self {
            start,
            end,
            total_frames: total_frames.max(1),
            done_frames: 0,
        }
    }

    pub fn current(&self) -> f32 {
        let t = self.done_frames.min(self.total_frames) as f32 / self.total_frames as f32;
        self.start + (self.end - self.start) * t
    }

    pub fn target(&self) -> f32 {
        self.end
    }

    pub fn is_finished(&self) -> bool {
        self.done_frames >= self.total_frames
    }

    fn step(&mut self) -> f32 {
        let gain = self.current();
        self.done_frames += 1;
        gain
    }
}

fn check_range(volume: f32) -> Result<(), StreamError> {
    if !(MIN_VOLUME..=MAX_VOLUME).contains(&volume) {
        return Err(StreamError::InvalidParameter(format!(
            "volume {volume} outside {MIN_VOLUME}..={MAX_VOLUME}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SoftwareVolume {
    volume: f32,
    ramp: Option<VolumeRamp>,
}

impl Default for SoftwareVolume {
    fn default() -> Self {
        Self {
            volume: MAX_VOLUME,
            ramp: None,
        }
    }
}

impl SoftwareVolume {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gain immediately. Cancels a ramp in progress.
    pub fn set_volume(&mut self, volume: f32) -> Result<(), StreamError> {
        check_range(volume)?;
        self.volume = volume;
        self.ramp = None;
        Ok(())
    }

    /// Move from the current gain to `target` over `duration_ms`
    pub fn set_volume_with_ramp(
        &mut self,
        target: f32,
        duration_ms: u32,
        sample_rate: u32,
    ) -> Result<(), StreamError> {
        check_range(target)?;
        let frames = sample_rate as u64 * duration_ms as u64 / 1000;
        if frames == 0 {
            return self.set_volume(target);
        }
        self.ramp = Some(VolumeRamp::new(self.volume(), target, frames));
        Ok(())
    }

    /// Gain at the next frame
    pub fn volume(&self) -> f32 {
        self.ramp.map_or(self.volume, |ramp| ramp.current())
    }

    pub fn is_ramping(&self) -> bool {
        self.ramp.is_some()
    }

    /// True when `apply` would leave the data untouched
    pub fn is_unity(&self) -> bool {
        self.ramp.is_none() && self.volume == MAX_VOLUME
    }

    pub fn apply(&mut self, data: &mut [u8], format: SampleFormat, channels: usize) {
        if self.is_unity() || channels == 0 {
            return;
        }
        let width = format.bytes_per_sample();
        for frame in data.chunks_exact_mut(width * channels) {
            let gain = match self.ramp.as_mut() {
                Some(ramp) => ramp.step(),
                None => self.volume,
            };
            for sample in frame.chunks_exact_mut(width) {
                let value = read_sample(format, sample) * gain;
                write_sample(format, value, sample);
            }
            if self.ramp.map_or(false, |ramp| ramp.is_finished()) {
                self.volume = self.ramp.map_or(self.volume, |ramp| ramp.target());
                self.ramp = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_range_checked() {
        let mut volume = SoftwareVolume::new();
        assert!(volume.set_volume(1.5).is_err());
        assert!(volume.set_volume(-0.1).is_err());
        assert!(volume.set_volume(0.5).is_ok());
        assert_eq!(volume.volume(), 0.5);
    }

    #[test]
    fn test_half_gain() {
        let mut volume = SoftwareVolume::new();
        volume.set_volume(0.5).unwrap();
        let mut data = s16(&[16000, -16000]);
        volume.apply(&mut data, SampleFormat::S16Le, 2);
        let out = to_i16(&data);
        assert!((out[0] - 8000).abs() <= 1);
        assert!((out[1] + 8000).abs() <= 1);
    }

    #[test]
    fn test_ramp_reaches_target_and_clears() {
        let mut volume = SoftwareVolume::new();
        volume.set_volume(0.0).unwrap();
        // 4 frames at 1000 Hz over 4 ms
        volume.set_volume_with_ramp(1.0, 4, 1000).unwrap();
        assert!(volume.is_ramping());

        let mut data = s16(&[10000; 6]);
        volume.apply(&mut data, SampleFormat::S16Le, 1);
        let out = to_i16(&data);
        assert_eq!(out[0], 0);
        assert!(out[1] < out[2] && out[2] < out[3]);
        assert_eq!(out[4], 10000);
        assert!(!volume.is_ramping());
        assert_eq!(volume.volume(), 1.0);
    }

    #[test]
    fn test_direct_set_supersedes_ramp() {
        let mut volume = SoftwareVolume::new();
        volume.set_volume_with_ramp(0.0, 1000, 48000).unwrap();
        volume.set_volume(0.25).unwrap();
        assert!(!volume.is_ramping());
        assert_eq!(volume.volume(), 0.25);
    }
}
