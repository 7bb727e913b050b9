//! Speaker playback via rodio.
//!
//! Accepts PCM16 mono bytes at a fixed rate (24 kHz for remote output),
//! converts to float, and queues into a bounded ring of ~60 seconds. A
//! rodio source drains the ring on the output stream, counting played
//! samples so barge-in can report how much audio the user actually
//! heard. A 100 ms meter timer reports the post-mix peak as a 0-255
//! level, but only while the ring is non-empty — silence produces no
//! meter events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::info;

use crate::error::AssistantError;

use super::{resample, METER_PERIOD_MS, SPEAKER_BUFFER_SECONDS};

/// Convert a linear window peak to a meter byte over [-60 dB, 0 dB].
pub fn peak_to_level(peak: f32) -> u8 {
    if peak <= 0.0 {
        return 0;
    }
    let db = 20.0 * peak.log10();
    let db = db.clamp(-60.0, 0.0);
    (((db + 60.0) / 60.0) * 255.0).round() as u8
}

/// State shared between the writer, the rodio source, and the meter task.
struct SpeakerShared {
    queue: Mutex<VecDeque<f32>>,
    capacity: usize,
    played_samples: AtomicU64,
    /// Peak of samples played since the last meter tick, stored as f32 bits.
    window_peak: AtomicU32,
    stopped: AtomicBool,
    sample_rate: u32,
}

impl SpeakerShared {
    fn update_peak(&self, sample: f32) {
        let abs = sample.abs();
        let mut current = f32::from_bits(self.window_peak.load(Ordering::Relaxed));
        while abs > current {
            match self.window_peak.compare_exchange_weak(
                current.to_bits(),
                abs.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = f32::from_bits(actual),
            }
        }
    }

    fn take_peak(&self) -> f32 {
        f32::from_bits(self.window_peak.swap(0, Ordering::Relaxed))
    }
}

/// Infinite rodio source backed by the shared ring. Emits silence while
/// the ring is empty so the output stream never stalls.
struct RingSource {
    shared: Arc<SpeakerShared>,
}

impl Iterator for RingSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return None;
        }
        let sample = self.shared.queue.lock().unwrap().pop_front();
        match sample {
            Some(s) => {
                self.shared.played_samples.fetch_add(1, Ordering::Relaxed);
                self.shared.update_peak(s);
                Some(s)
            }
            None => Some(0.0),
        }
    }
}

impl Source for RingSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

/// Speaker accepting PCM16 mono at a configured sample rate.
pub struct Speaker {
    _stream: OutputStream,
    _handle: OutputStreamHandle,
    sink: Sink,
    shared: Arc<SpeakerShared>,
    meter_task: Option<tokio::task::JoinHandle<()>>,
}

impl Speaker {
    /// Open the default output device for `sample_rate` PCM16 mono input.
    pub fn new(sample_rate: u32) -> Result<Self, AssistantError> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| AssistantError::Device(format!("open audio output: {e}")))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| AssistantError::Device(format!("create audio sink: {e}")))?;

        let shared = Arc::new(SpeakerShared {
            queue: Mutex::new(VecDeque::new()),
            capacity: sample_rate as usize * SPEAKER_BUFFER_SECONDS,
            played_samples: AtomicU64::new(0),
            window_peak: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            sample_rate,
        });

        info!(sample_rate, "audio playback initialized");

        Ok(Self {
            _stream: stream,
            _handle: handle,
            sink,
            shared,
            meter_task: None,
        })
    }

    /// Begin draining the ring onto the output device.
    pub fn start(&self) {
        self.sink.append(RingSource {
            shared: Arc::clone(&self.shared),
        });
        self.sink.play();
    }

    /// Set logical playback volume as a fraction of full scale.
    pub fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    /// Queue little-endian PCM16 bytes for playback. When the ring is
    /// over capacity the oldest audio is dropped.
    pub fn write(&self, pcm: &[u8]) {
        let samples = resample::pcm16_to_f32(&resample::bytes_to_pcm16(pcm));
        let mut queue = self.shared.queue.lock().unwrap();
        queue.extend(samples);
        let overflow = queue.len().saturating_sub(self.shared.capacity);
        if overflow > 0 {
            queue.drain(..overflow);
        }
    }

    /// Drop all buffered audio immediately.
    pub fn clear(&self) {
        self.shared.queue.lock().unwrap().clear();
    }

    /// Number of samples waiting to be played.
    pub fn buffered_samples(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Resolve once the ring has drained.
    pub async fn flush(&self) {
        while !self.shared.stopped.load(Ordering::Acquire) && self.buffered_samples() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Milliseconds of audio actually played since construction.
    pub fn estimated_played_ms(&self) -> u64 {
        self.shared.played_samples.load(Ordering::Relaxed) * 1000 / self.shared.sample_rate as u64
    }

    /// Register a peak-meter callback, sampled every 100 ms. The
    /// callback fires only while the ring holds audio.
    pub fn set_meter_callback(&mut self, callback: impl Fn(u8) + Send + Sync + 'static) {
        if let Some(task) = self.meter_task.take() {
            task.abort();
        }
        let shared = Arc::clone(&self.shared);
        self.meter_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(METER_PERIOD_MS));
            loop {
                ticker.tick().await;
                if shared.stopped.load(Ordering::Acquire) {
                    break;
                }
                let non_empty = !shared.queue.lock().unwrap().is_empty();
                let peak = shared.take_peak();
                if non_empty {
                    callback(peak_to_level(peak));
                }
            }
        }));
    }

    /// Stop playback and release the output device.
    pub fn stop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        if let Some(task) = self.meter_task.take() {
            task.abort();
        }
        self.sink.stop();
        self.clear();
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        self.stop();
    }
}

// SAFETY: OutputStream is !Send due to a PhantomData<*mut ()> in cpal's
// platform abstraction. The struct is only driven from the thread that
// owns it (guarded by the agent's speaker mutex); the audio callback
// side touches only the Arc'd shared state.
unsafe impl Send for Speaker {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_maps_to_zero() {
        assert_eq!(peak_to_level(0.0), 0);
        assert_eq!(peak_to_level(-1.0), 0);
    }

    #[test]
    fn full_scale_maps_to_max() {
        assert_eq!(peak_to_level(1.0), 255);
    }

    #[test]
    fn floor_clamps_to_zero() {
        // -60 dB corresponds to amplitude 0.001.
        assert_eq!(peak_to_level(0.001), 0);
        assert_eq!(peak_to_level(0.0001), 0);
    }

    #[test]
    fn mid_levels_are_monotonic() {
        let quiet = peak_to_level(0.01);
        let loud = peak_to_level(0.5);
        assert!(quiet > 0);
        assert!(loud > quiet);
        assert!(loud < 255);
    }
}
