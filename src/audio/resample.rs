//! Nearest-neighbour resampling and PCM16⇄float conversion.
//!
//! Nearest-neighbour is intentional: phase accuracy is irrelevant for
//! the VAD feed and for short uplink frames, and it costs nothing on a
//! small board.

/// Resample mono i16 samples from `from_rate` to `to_rate` by
/// nearest-neighbour index mapping. Pass-through when rates match.
pub fn resample_nearest(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() {
        return input.to_vec();
    }
    let out_len = (input.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = (i as u64 * from_rate as u64 + to_rate as u64 / 2) / to_rate as u64;
        let idx = (src as usize).min(input.len() - 1);
        output.push(input[idx]);
    }
    output
}

/// Convert PCM16 samples to float in [-1.0, 1.0].
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Interpret little-endian PCM16 bytes as samples. A trailing odd byte
/// is dropped.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Serialize samples as little-endian PCM16 bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Peak amplitude of a frame (max |sample|). Used by the wake-stage
/// noise gate.
pub fn frame_amplitude(frame: &[i16]) -> i32 {
    frame.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_when_rates_match() {
        let input = [1i16, 2, 3, 4];
        assert_eq!(resample_nearest(&input, 16_000, 16_000), input);
    }

    #[test]
    fn upsample_preserves_length_ratio() {
        let input: Vec<i16> = (0..512).map(|i| i as i16).collect();
        let out = resample_nearest(&input, 16_000, 24_000);
        assert_eq!(out.len(), 768);
        assert_eq!(out[0], input[0]);
        assert_eq!(*out.last().unwrap(), *input.last().unwrap());
    }

    #[test]
    fn downsample_preserves_length_ratio() {
        let input: Vec<i16> = (0..768).map(|i| i as i16).collect();
        let out = resample_nearest(&input, 24_000, 16_000);
        assert_eq!(out.len(), 512);
    }

    #[test]
    fn pcm_byte_round_trip() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(bytes_to_pcm16(&pcm16_to_bytes(&samples)), samples);
    }

    #[test]
    fn trailing_odd_byte_is_dropped() {
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xff]), vec![1]);
    }

    #[test]
    fn float_conversion_range() {
        let f = pcm16_to_f32(&[i16::MIN, 0, i16::MAX]);
        assert_eq!(f[0], -1.0);
        assert_eq!(f[1], 0.0);
        assert!(f[2] < 1.0 && f[2] > 0.999);
    }

    #[test]
    fn amplitude_is_peak_absolute() {
        assert_eq!(frame_amplitude(&[]), 0);
        assert_eq!(frame_amplitude(&[-300, 120, 50]), 300);
        assert_eq!(frame_amplitude(&[i16::MIN]), 32768);
    }
}
