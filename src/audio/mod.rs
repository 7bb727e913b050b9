//! Audio I/O primitives: capture, playback, resampling.

pub mod capture;
pub mod playback;
pub mod resample;
pub mod ring_buffer;

pub use capture::Microphone;
pub use playback::Speaker;

/// Microphone frame length in samples (realtime path).
pub const CAPTURE_FRAME_SAMPLES: usize = 512;

/// Sample rate the VAD model expects.
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Sample rate for remote uplink and downlink audio (PCM16 mono).
pub const REMOTE_SAMPLE_RATE: u32 = 24_000;

/// Bytes written to the speaker per chunk while streaming a response.
pub const SPEAKER_CHUNK_SIZE: usize = 4096;

/// Peak-meter sampling period.
pub const METER_PERIOD_MS: u64 = 100;

/// Speaker ring capacity in seconds of queued audio.
pub const SPEAKER_BUFFER_SECONDS: usize = 60;
