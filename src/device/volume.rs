//! Perceptual volume mapping.
//!
//! Logical volume is 0-10; hardware gain is a fraction of full scale.
//! Loudness perception is roughly logarithmic, so the logical scale is
//! mapped through a power curve (exponent 0.4 on the readback side) to
//! spread audible steps evenly.

use std::sync::atomic::{AtomicU32, Ordering};

const CURVE_EXPONENT: f32 = 0.4;

/// Map a logical level 0-10 onto a hardware gain fraction [0, 1].
pub fn to_hardware(level: u8) -> f32 {
    let level = level.min(10) as f32 / 10.0;
    level.powf(1.0 / CURVE_EXPONENT)
}

/// Inverse mapping: hardware gain fraction back to the logical 0-10 scale.
pub fn from_hardware(gain: f32) -> u8 {
    let gain = gain.clamp(0.0, 1.0);
    (gain.powf(CURVE_EXPONENT) * 10.0).round() as u8
}

/// Mixer control surface. The default implementation holds gain in
/// software; a hardware mixer driver implements the same trait.
pub trait VolumeControl: Send + Sync {
    /// Apply a logical 0-10 playback volume.
    fn set_playback_volume(&self, level: u8);

    /// Read back the logical playback volume.
    fn get_playback_volume(&self) -> u8;

    /// Current hardware gain fraction, for wiring into an audio sink.
    fn gain(&self) -> f32;
}

/// Software volume holding the gain as an atomic fraction.
pub struct SoftwareVolume {
    gain_bits: AtomicU32,
}

impl SoftwareVolume {
    pub fn new() -> Self {
        Self {
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
        }
    }
}

impl Default for SoftwareVolume {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeControl for SoftwareVolume {
    fn set_playback_volume(&self, level: u8) {
        self.gain_bits
            .store(to_hardware(level).to_bits(), Ordering::Release);
    }

    fn get_playback_volume(&self) -> u8 {
        from_hardware(self.gain())
    }

    fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_one_step() {
        for level in 0..=10u8 {
            let back = from_hardware(to_hardware(level));
            assert!(
                (back as i16 - level as i16).abs() <= 1,
                "level {level} came back as {back}"
            );
        }
    }

    #[test]
    fn endpoints_are_exact() {
        assert_eq!(to_hardware(0), 0.0);
        assert_eq!(to_hardware(10), 1.0);
        assert_eq!(from_hardware(0.0), 0);
        assert_eq!(from_hardware(1.0), 10);
    }

    #[test]
    fn curve_is_monotonic() {
        let mut prev = -1.0f32;
        for level in 0..=10u8 {
            let gain = to_hardware(level);
            assert!(gain > prev);
            prev = gain;
        }
    }

    #[test]
    fn low_levels_map_to_small_gains() {
        // The perceptual curve compresses the bottom of the scale.
        assert!(to_hardware(5) < 0.5);
    }

    #[test]
    fn software_volume_round_trips() {
        let vol = SoftwareVolume::new();
        for level in 0..=10u8 {
            vol.set_playback_volume(level);
            let back = vol.get_playback_volume();
            assert!((back as i16 - level as i16).abs() <= 1);
        }
    }
}
