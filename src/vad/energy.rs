//! Energy-based voice activity fallback.
//!
//! Mean absolute amplitude as a cheap energy proxy, used when the
//! neural VAD model is unavailable.

/// Threshold over mean absolute amplitude treated as speech.
pub const ENERGY_SPEECH_THRESHOLD: f32 = 0.01;

/// Compute the energy level of an audio frame.
pub fn detect(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f32 = frame.iter().map(|s| s.abs()).sum();
    sum / frame.len() as f32
}
