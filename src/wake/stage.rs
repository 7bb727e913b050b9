//! Noise-gated wake-word stage.
//!
//! Two-stage gate over microphone frames. While idle, a cheap amplitude
//! check keeps the wake models cold; the last few frames are retained in
//! a pre-buffer so the onset of a wake phrase is not clipped. Sustained
//! noise activates the engine over the buffered history, then live
//! frames stream through it until a model fires or silence returns.

use std::collections::VecDeque;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::resample::{frame_amplitude, resample_nearest};
use crate::audio::{Microphone, CAPTURE_FRAME_SAMPLES, VAD_SAMPLE_RATE};
use crate::bus::{EventBus, EventPayload};
use crate::error::AssistantError;

use super::WakeEngine;

/// Frames of history retained while idle.
const PRE_BUFFER_LENGTH: usize = 10;

/// Consecutive non-silent frames required to activate.
const NOISE_ACTIVATION_FRAME_COUNT: u32 = 5;

/// Cap on buffered speech frames (~3 s at 16 kHz).
const MAX_SPEECH_BUFFER_FRAMES: usize = 100;

/// Consecutive silent frames (~1.6 s) before returning to idle.
const MIN_SILENCE_FRAMES: u32 = 50;

/// Silent frames injected at start to absorb first-inference latency.
const WARM_UP_FRAMES: usize = 50;

const SENDER: &str = "wake-stage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Active,
}

/// Noise-gated wake-word loop over microphone frames.
pub struct WakeStage {
    engine: WakeEngine,
    bus: EventBus,
    /// Frame amplitude below this is silence; ≤ 0 disables the gate.
    silence_threshold: i32,
    state: GateState,
    pre_buffer: VecDeque<Vec<i16>>,
    speech_buffer: Vec<Vec<i16>>,
    noise_frames: u32,
    silence_frames: u32,
}

impl WakeStage {
    pub fn new(engine: WakeEngine, bus: EventBus, silence_threshold: i32) -> Self {
        Self {
            engine,
            bus,
            silence_threshold,
            state: GateState::Idle,
            pre_buffer: VecDeque::with_capacity(PRE_BUFFER_LENGTH),
            speech_buffer: Vec::new(),
            noise_frames: 0,
            silence_frames: 0,
        }
    }

    fn gate_enabled(&self) -> bool {
        self.silence_threshold > 0
    }

    fn is_silent(&self, frame: &[i16]) -> bool {
        frame_amplitude(frame) < self.silence_threshold
    }

    fn reset(&mut self) {
        self.state = GateState::Idle;
        self.pre_buffer.clear();
        self.speech_buffer.clear();
        self.noise_frames = 0;
        self.silence_frames = 0;
        self.engine.reset();
    }

    /// Advance on one 16 kHz frame. Returns the fired wake-word id.
    fn step(&mut self, frame: Vec<i16>) -> Option<String> {
        if !self.gate_enabled() {
            return self
                .engine
                .process(&frame)
                .map(|k| self.engine.model_name(k).to_string());
        }

        match self.state {
            GateState::Idle => {
                if self.is_silent(&frame) {
                    self.noise_frames = 0;
                } else {
                    self.noise_frames += 1;
                }

                if self.pre_buffer.len() == PRE_BUFFER_LENGTH {
                    self.pre_buffer.pop_front();
                }
                self.pre_buffer.push_back(frame);

                if self.noise_frames >= NOISE_ACTIVATION_FRAME_COUNT {
                    self.bus.publish(SENDER, EventPayload::NoiseDetected);
                    debug!("noise detected, wake engine active");

                    self.speech_buffer.extend(self.pre_buffer.drain(..));
                    self.state = GateState::Active;
                    self.noise_frames = 0;
                    self.silence_frames = 0;

                    // Catch a wake phrase that started inside the pre-buffer.
                    for i in 0..self.speech_buffer.len() {
                        if let Some(k) = self.engine.process(&self.speech_buffer[i]) {
                            let name = self.engine.model_name(k).to_string();
                            self.reset();
                            return Some(name);
                        }
                    }
                }
                None
            }
            GateState::Active => {
                if let Some(k) = self.engine.process(&frame) {
                    let name = self.engine.model_name(k).to_string();
                    self.reset();
                    return Some(name);
                }

                if self.speech_buffer.len() == MAX_SPEECH_BUFFER_FRAMES {
                    self.speech_buffer.remove(0);
                }
                self.speech_buffer.push(frame.clone());

                if self.is_silent(&frame) {
                    self.silence_frames += 1;
                    if self.silence_frames >= MIN_SILENCE_FRAMES {
                        self.bus.publish(SENDER, EventPayload::SilenceDetected);
                        debug!("silence detected, wake engine idle");
                        self.reset();
                    }
                } else {
                    self.silence_frames = 0;
                }
                None
            }
        }
    }

    /// Block until a wake word fires or `cancel` triggers.
    ///
    /// Opens the capture device for the duration of the call. Returns
    /// `Ok(None)` on cancellation; fails only when the capture device
    /// cannot be opened.
    pub async fn wait_for_wake_word(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, AssistantError> {
        let mut mic = Microphone::open(None)?;
        let native_rate = mic.native_sample_rate();

        // Warm up the inference pipeline on silence so the first real
        // frames are not delayed by model initialization.
        let silent = vec![0i16; CAPTURE_FRAME_SAMPLES];
        for _ in 0..WARM_UP_FRAMES {
            let _ = self.engine.process(&silent);
        }

        info!("waiting for wake word");
        loop {
            if cancel.is_cancelled() {
                self.reset();
                return Ok(None);
            }

            let Some(frame) = mic.read_frame() else {
                tokio::time::sleep(Duration::from_millis(1)).await;
                continue;
            };

            let frame = resample_nearest(&frame, native_rate, VAD_SAMPLE_RATE);
            if let Some(model) = self.step(frame) {
                info!(model = %model, "wake word detected");
                return Ok(Some(model));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::wake::{WakeModelConfig, WakeScorer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scorer that reports a fixed score for every frame once at least
    /// `fire_after` frames have been seen.
    struct CountingScorer {
        frames: usize,
        fire_after: usize,
        score: f32,
    }

    impl WakeScorer for CountingScorer {
        fn score(&mut self, _frame: &[i16]) -> Vec<Vec<f32>> {
            self.frames += 1;
            if self.frames > self.fire_after {
                vec![vec![self.score]]
            } else {
                vec![vec![0.0]]
            }
        }

        fn reset(&mut self) {
            self.frames = 0;
        }
    }

    fn test_engine(fire_after: usize, score: f32) -> WakeEngine {
        WakeEngine::new(
            &[WakeModelConfig {
                model_id: "hey_test".into(),
                threshold: 0.5,
                trigger_level: 1,
            }],
            Box::new(CountingScorer {
                frames: 0,
                fire_after,
                score,
            }),
        )
    }

    fn loud_frame() -> Vec<i16> {
        vec![1000i16; 512]
    }

    fn quiet_frame() -> Vec<i16> {
        vec![0i16; 512]
    }

    fn counter_on(bus: &EventBus, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe(
            kind,
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        count
    }

    #[test]
    fn noise_gate_requires_consecutive_loud_frames() {
        let bus = EventBus::new();
        let noise = counter_on(&bus, EventKind::NoiseDetected);
        // Never fires; we only watch the gate.
        let mut stage = WakeStage::new(test_engine(usize::MAX, 0.0), bus, 500);

        // Four loud frames, one quiet, four loud: no activation.
        for _ in 0..4 {
            assert!(stage.step(loud_frame()).is_none());
        }
        stage.step(quiet_frame());
        for _ in 0..4 {
            stage.step(loud_frame());
        }
        assert_eq!(noise.load(Ordering::SeqCst), 0);
        assert_eq!(stage.state, GateState::Idle);

        // Fifth consecutive loud frame activates.
        stage.step(loud_frame());
        assert_eq!(noise.load(Ordering::SeqCst), 1);
        assert_eq!(stage.state, GateState::Active);
    }

    #[test]
    fn zero_threshold_skips_the_gate() {
        let bus = EventBus::new();
        let noise = counter_on(&bus, EventKind::NoiseDetected);
        let mut stage = WakeStage::new(test_engine(0, 0.9), bus, 0);

        // First frame goes straight into the engine and fires.
        assert_eq!(stage.step(quiet_frame()).as_deref(), Some("hey_test"));
        assert_eq!(noise.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn silence_returns_stage_to_pristine_idle() {
        let bus = EventBus::new();
        let silence = counter_on(&bus, EventKind::SilenceDetected);
        let mut stage = WakeStage::new(test_engine(usize::MAX, 0.0), bus, 500);

        for _ in 0..5 {
            stage.step(loud_frame());
        }
        assert_eq!(stage.state, GateState::Active);

        for _ in 0..MIN_SILENCE_FRAMES {
            stage.step(quiet_frame());
        }
        assert_eq!(silence.load(Ordering::SeqCst), 1);
        assert_eq!(stage.state, GateState::Idle);
        assert!(stage.pre_buffer.is_empty());
        assert!(stage.speech_buffer.is_empty());
        assert_eq!(stage.noise_frames, 0);
        assert_eq!(stage.silence_frames, 0);
    }

    #[test]
    fn loud_frame_resets_silence_counter() {
        let bus = EventBus::new();
        let silence = counter_on(&bus, EventKind::SilenceDetected);
        let mut stage = WakeStage::new(test_engine(usize::MAX, 0.0), bus, 500);

        for _ in 0..5 {
            stage.step(loud_frame());
        }
        for _ in 0..(MIN_SILENCE_FRAMES - 1) {
            stage.step(quiet_frame());
        }
        stage.step(loud_frame());
        for _ in 0..(MIN_SILENCE_FRAMES - 1) {
            stage.step(quiet_frame());
        }
        assert_eq!(silence.load(Ordering::SeqCst), 0);
        assert_eq!(stage.state, GateState::Active);
    }

    #[test]
    fn wake_word_detected_while_active() {
        let bus = EventBus::new();
        // Engine fires once frames past the pre-buffer flush arrive.
        let mut stage = WakeStage::new(test_engine(12, 0.9), bus, 500);

        for _ in 0..5 {
            assert!(stage.step(loud_frame()).is_none());
        }
        // Pre-buffer flush fed 5 frames; keep feeding until the scripted
        // scorer starts reporting hits.
        let mut detected = None;
        for _ in 0..20 {
            detected = stage.step(loud_frame());
            if detected.is_some() {
                break;
            }
        }
        assert_eq!(detected.as_deref(), Some("hey_test"));
        // Detection resets the stage.
        assert_eq!(stage.state, GateState::Idle);
        assert!(stage.speech_buffer.is_empty());
    }

    #[test]
    fn pre_buffer_is_bounded() {
        let bus = EventBus::new();
        let mut stage = WakeStage::new(test_engine(usize::MAX, 0.0), bus, 500);
        // Quiet frames accumulate in the pre-buffer without activating.
        for _ in 0..50 {
            stage.step(quiet_frame());
        }
        assert_eq!(stage.pre_buffer.len(), PRE_BUFFER_LENGTH);
        assert_eq!(stage.state, GateState::Idle);
    }
}
