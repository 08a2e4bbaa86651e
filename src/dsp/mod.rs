//! Pre-transfer sample processing
//!
//! Pure buffer-in/buffer-out transforms applied on the data path before
//! bytes reach the ring cache: software volume with ramps, channel blending
//! and speed change. All of them work on interleaved PCM in any
//! [`SampleFormat`], converting through normalized `f32`.

pub mod blend;
pub mod speed;
pub mod volume;

pub use blend::ChannelBlendMode;
pub use speed::{LinearSpeed, SpeedTransform, MAX_SPEED, MIN_SPEED};
pub use volume::{SoftwareVolume, VolumeRamp};

use crate::format::SampleFormat;

/// Decode one sample to the range `[-1.0, 1.0)`
pub fn read_sample(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => (bytes[0] as f32 - 128.0) / 128.0,
        SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0,
        SampleFormat::S24Le => {
            // sign-extend through the top byte of an i32
            let raw = i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8;
            raw as f32 / 8_388_608.0
        }
        SampleFormat::S32Le => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32 / 2_147_483_648.0
        }
        SampleFormat::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

/// Encode one normalized sample, clipping out-of-range values
pub fn write_sample(format: SampleFormat, value: f32, out: &mut [u8]) {
    let v = value.clamp(-1.0, 1.0);
    match format {
        SampleFormat::U8 => out[0] = (v * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8,
        SampleFormat::S16Le => {
            let s = (v * 32767.0).round() as i16;
            out[..2].copy_from_slice(&s.to_le_bytes());
        }
        SampleFormat::S24Le => {
            let s = (v as f64 * 8_388_607.0).round() as i32;
            out[..3].copy_from_slice(&s.to_le_bytes()[..3]);
        }
        SampleFormat::S32Le => {
            let s = (v as f64 * 2_147_483_647.0).round() as i32;
            out[..4].copy_from_slice(&s.to_le_bytes());
        }
        SampleFormat::F32Le => out[..4].copy_from_slice(&value.to_le_bytes()),
    }
}

/// Decode interleaved bytes into normalized samples
pub fn decode(format: SampleFormat, bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(format.bytes_per_sample())
        .map(|b| read_sample(format, b))
        .collect()
}

/// Encode normalized samples, appending to `out`
pub fn encode_into(format: SampleFormat, samples: &[f32], out: &mut Vec<u8>) {
    let width = format.bytes_per_sample();
    let start = out.len();
    out.resize(start + samples.len() * width, 0);
    for (sample, slot) in samples.iter().zip(out[start..].chunks_exact_mut(width)) {
        write_sample(format, *sample, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion_all_formats() {
        for format in [
            SampleFormat::U8,
            SampleFormat::S16Le,
            SampleFormat::S24Le,
            SampleFormat::S32Le,
            SampleFormat::F32Le,
        ] {
            let mut buf = [0u8; 4];
            for value in [-0.5f32, 0.0, 0.25] {
                write_sample(format, value, &mut buf);
                let back = read_sample(format, &buf);
                assert!((back - value).abs() < 0.01, "{format:?} {value} -> {back}");
            }
        }
    }

    #[test]
    fn test_s24_sign_extension() {
        assert_eq!(read_sample(SampleFormat::S24Le, &[0xff, 0xff, 0xff]), -1.0 / 8_388_608.0);
        assert!(read_sample(SampleFormat::S24Le, &[0x00, 0x00, 0x80]) <= -0.999);
    }

    #[test]
    fn test_clipping() {
        let mut buf = [0u8; 2];
        write_sample(SampleFormat::S16Le, 3.0, &mut buf);
        assert_eq!(i16::from_le_bytes(buf), 32767);
        write_sample(SampleFormat::S16Le, -3.0, &mut buf);
        assert_eq!(i16::from_le_bytes(buf), -32767);
    }
}
