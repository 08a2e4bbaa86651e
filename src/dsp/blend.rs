//! Stereo channel blending

use serde::{Deserialize, Serialize};

use crate::format::SampleFormat;

use super::{read_sample, write_sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelBlendMode {
    #[default]
    Default,
    /// Both channels carry the average of left and right
    BlendLr,
    AllLeft,
    AllRight,
}

/// Apply `mode` to every left/right pair of each frame
pub fn apply_blend(mode: ChannelBlendMode, data: &mut [u8], format: SampleFormat, channels: usize) {
    if mode == ChannelBlendMode::Default || channels < 2 {
        return;
    }
    let width = format.bytes_per_sample();
    for frame in data.chunks_exact_mut(width * channels) {
        for pair in frame.chunks_exact_mut(width * 2) {
            let (left, right) = pair.split_at_mut(width);
            let l = read_sample(format, left);
            let r = read_sample(format, right);
            let (new_l, new_r) = match mode {
                ChannelBlendMode::BlendLr => {
                    let mid = (l + r) / 2.0;
                    (mid, mid)
                }
                ChannelBlendMode::AllLeft => (l, l),
                ChannelBlendMode::AllRight => (r, r),
                ChannelBlendMode::Default => (l, r),
            };
            write_sample(format, new_l, left);
            write_sample(format, new_r, right);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_modes() {
        let frame: Vec<u8> = [100i16, 300].iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut data = frame.clone();
        apply_blend(ChannelBlendMode::AllLeft, &mut data, SampleFormat::S16Le, 2);
        assert_eq!(data[2..4], 100i16.to_le_bytes());

        let mut data = frame.clone();
        apply_blend(ChannelBlendMode::AllRight, &mut data, SampleFormat::S16Le, 2);
        assert_eq!(data[0..2], 300i16.to_le_bytes());

        let mut data = frame.clone();
        apply_blend(ChannelBlendMode::BlendLr, &mut data, SampleFormat::S16Le, 2);
        let mid = i16::from_le_bytes([data[0], data[1]]);
        assert!((mid - 200).abs() <= 1);

        let mut data = frame.clone();
        apply_blend(ChannelBlendMode::Default, &mut data, SampleFormat::S16Le, 2);
        assert_eq!(data, frame);
    }

    #[test]
    fn test_mono_untouched() {
        let mut data = vec![1u8, 2, 3, 4];
        apply_blend(ChannelBlendMode::AllLeft, &mut data, SampleFormat::S16Le, 1);
        assert_eq!(data, vec![1, 2, 3, 4]);
    }
}
