//! Streaming neural voice-activity detection (Silero, via ONNX Runtime).
//!
//! Processes fixed-length windows (512 samples at 16 kHz, 256 at 8 kHz)
//! of float audio in [-1, 1] and returns a speech probability.
//! Maintains LSTM hidden state (h, c tensors) across calls; `reset()`
//! clears it between utterances and after barge-in.
//!
//! When the `onnx` feature is disabled, or the model file is missing,
//! falls back to energy-based detection.

pub mod energy;

use std::path::Path;

use crate::error::AssistantError;

/// Supported rates and their window sizes.
fn window_for_rate(sample_rate: u32) -> Option<usize> {
    match sample_rate {
        16_000 => Some(512),
        8_000 => Some(256),
        _ => None,
    }
}

// -----------------------------------------------------------------------
// onnx: real ONNX implementation
// -----------------------------------------------------------------------
#[cfg(feature = "onnx")]
mod inner {
    use super::*;
    use ort::session::Session;
    use tracing::{info, warn};

    const STATE_SIZE: usize = 2 * 1 * 128;

    pub struct VadDetector {
        session: Option<Session>,
        sample_rate: u32,
        window: usize,
        /// LSTM hidden state h: shape [2, 1, 128]
        h: Vec<f32>,
        /// LSTM cell state c: shape [2, 1, 128]
        c: Vec<f32>,
    }

    impl VadDetector {
        pub fn new(sample_rate: u32) -> Result<Self, AssistantError> {
            let window = window_for_rate(sample_rate).ok_or_else(|| {
                AssistantError::Configuration(format!(
                    "unsupported VAD sample rate: {sample_rate} (use 8000 or 16000)"
                ))
            })?;
            Ok(Self {
                session: None,
                sample_rate,
                window,
                h: vec![0.0; STATE_SIZE],
                c: vec![0.0; STATE_SIZE],
            })
        }

        pub fn is_loaded(&self) -> bool {
            self.session.is_some()
        }

        /// Expected input frame length in samples.
        pub fn frame_len(&self) -> usize {
            self.window
        }

        pub fn load(&mut self, model_dir: &Path) -> bool {
            let model_path = model_dir.join("silero_vad.onnx");
            if !model_path.exists() {
                warn!(
                    "VAD model not found at {} — using energy fallback",
                    model_path.display()
                );
                return false;
            }

            match Session::builder()
                .and_then(|b| b.with_intra_threads(1))
                .and_then(|b| b.with_inter_threads(1))
                .and_then(|b| b.commit_from_file(&model_path))
            {
                Ok(session) => {
                    self.session = Some(session);
                    self.reset();
                    info!("VAD loaded from {}", model_path.display());
                    true
                }
                Err(e) => {
                    warn!("Failed to load VAD: {} — using energy fallback", e);
                    self.session = None;
                    false
                }
            }
        }

        /// Clear recurrent state. Two runs over the same audio after a
        /// reset produce identical per-frame probabilities.
        pub fn reset(&mut self) {
            self.h = vec![0.0; STATE_SIZE];
            self.c = vec![0.0; STATE_SIZE];
        }

        fn infer(&mut self, frame: &[f32]) -> Result<f32, String> {
            let session = self.session.as_mut().ok_or("model not loaded")?;

            let input_tensor =
                ort::value::Value::from_array(([1, frame.len()], frame.to_vec()))
                    .map_err(|e| format!("input value: {e}"))?;
            let sr_tensor =
                ort::value::Value::from_array(([1], vec![self.sample_rate as i64]))
                    .map_err(|e| format!("sr value: {e}"))?;
            let h_tensor = ort::value::Value::from_array(([2, 1, 128], self.h.clone()))
                .map_err(|e| format!("h value: {e}"))?;
            let c_tensor = ort::value::Value::from_array(([2, 1, 128], self.c.clone()))
                .map_err(|e| format!("c value: {e}"))?;

            let inputs = ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "h" => h_tensor,
                "c" => c_tensor,
            ];
            let outputs = session.run(inputs).map_err(|e| format!("inference: {e}"))?;

            let prob = {
                let (_shape, data) = outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| format!("extract prob: {e}"))?;
                *data.first().ok_or("empty probability output")?
            };
            {
                let (_shape, data) = outputs[1]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| format!("extract h: {e}"))?;
                self.h = data.to_vec();
            }
            {
                let (_shape, data) = outputs[2]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| format!("extract c: {e}"))?;
                self.c = data.to_vec();
            }

            Ok(prob)
        }

        /// Speech probability for one fixed-length frame.
        pub fn predict(&mut self, frame: &[f32]) -> f32 {
            if !self.is_loaded() {
                return Self::energy_fallback(frame);
            }
            match self.infer(frame) {
                Ok(prob) => prob,
                Err(e) => {
                    warn!("VAD inference error: {}", e);
                    Self::energy_fallback(frame)
                }
            }
        }

        fn energy_fallback(frame: &[f32]) -> f32 {
            if energy::detect(frame) > energy::ENERGY_SPEECH_THRESHOLD {
                1.0
            } else {
                0.0
            }
        }
    }
}

// -----------------------------------------------------------------------
// Stub: no onnx feature
// -----------------------------------------------------------------------
#[cfg(not(feature = "onnx"))]
mod inner {
    use super::*;
    use tracing::warn;

    #[derive(Debug)]
    pub struct VadDetector {
        window: usize,
    }

    impl VadDetector {
        pub fn new(sample_rate: u32) -> Result<Self, AssistantError> {
            let window = window_for_rate(sample_rate).ok_or_else(|| {
                AssistantError::Configuration(format!(
                    "unsupported VAD sample rate: {sample_rate} (use 8000 or 16000)"
                ))
            })?;
            Ok(Self { window })
        }

        pub fn is_loaded(&self) -> bool {
            false
        }

        pub fn frame_len(&self) -> usize {
            self.window
        }

        pub fn load(&mut self, _model_dir: &Path) -> bool {
            warn!("VAD not available (onnx feature disabled) — using energy fallback");
            false
        }

        pub fn reset(&mut self) {}

        pub fn predict(&mut self, frame: &[f32]) -> f32 {
            if energy::detect(frame) > energy::ENERGY_SPEECH_THRESHOLD {
                1.0
            } else {
                0.0
            }
        }
    }
}

pub use inner::VadDetector;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_rate() {
        let err = VadDetector::new(44_100).unwrap_err();
        assert!(matches!(err, AssistantError::Configuration(_)));
    }

    #[test]
    fn window_matches_rate() {
        assert_eq!(VadDetector::new(16_000).unwrap().frame_len(), 512);
        assert_eq!(VadDetector::new(8_000).unwrap().frame_len(), 256);
    }

    #[test]
    fn fallback_detects_energy() {
        let mut vad = VadDetector::new(16_000).unwrap();
        let loud = vec![0.5f32; 512];
        let quiet = vec![0.0f32; 512];
        assert!(vad.predict(&loud) >= 0.5);
        assert!(vad.predict(&quiet) < 0.5);
    }
}
