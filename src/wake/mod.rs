//! Multi-model streaming wake-word inference.
//!
//! Three-stage pipeline (openWakeWord layout): a shared melspectrogram
//! model, a shared embedding model, and one small classifier per
//! configured wake word. Raw 16 kHz frames are buffered into
//! 1280-sample chunks for the pipeline; every completed inference step
//! yields one score per model.
//!
//! Firing is debounced per model with a sliding count: an
//! above-threshold score bumps the model's activation counter, a below-
//! threshold score decays it by one, and the model fires when the
//! counter reaches its trigger level. Models do not interfere with each
//! other. The first ~50 frames after a reset are warm-up; the wake
//! stage feeds silence through to mask first-inference latency.

pub mod stage;

/// One wake-word model with its debounce parameters.
#[derive(Debug, Clone)]
pub struct WakeModelConfig {
    /// Classifier file stem under the model directory.
    pub model_id: String,
    /// Score at or above this counts towards activation.
    pub threshold: f32,
    /// Activation count required to fire.
    pub trigger_level: u32,
}

/// Scores raw frames into per-model confidences. One implementation
/// wraps the ONNX pipeline; tests drive the engine with scripted scores.
pub trait WakeScorer: Send {
    /// Feed one capture frame. Returns one score row per completed
    /// inference step (empty while the pipeline is still buffering).
    /// Each row holds one score per configured model.
    fn score(&mut self, frame: &[i16]) -> Vec<Vec<f32>>;

    /// Drop buffered audio and any accumulated pipeline state.
    fn reset(&mut self);
}

struct ModelState {
    threshold: f32,
    trigger_level: u32,
    counter: u32,
}

/// Streaming wake-word engine over N models.
pub struct WakeEngine {
    scorer: Box<dyn WakeScorer>,
    models: Vec<ModelState>,
    names: Vec<String>,
}

impl WakeEngine {
    pub fn new(configs: &[WakeModelConfig], scorer: Box<dyn WakeScorer>) -> Self {
        Self {
            models: configs
                .iter()
                .map(|c| ModelState {
                    threshold: c.threshold,
                    trigger_level: c.trigger_level.max(1),
                    counter: 0,
                })
                .collect(),
            names: configs.iter().map(|c| c.model_id.clone()).collect(),
            scorer,
        }
    }

    /// Engine backed by the ONNX pipeline in `model_dir`.
    pub fn with_models(
        configs: &[WakeModelConfig],
        model_dir: &std::path::Path,
    ) -> Self {
        let scorer = onnx::OnnxScorer::load(configs, model_dir);
        Self::new(configs, Box::new(scorer))
    }

    /// Wake-word identifier for a fired model index.
    pub fn model_name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Advance every model on `frame`; returns the index of the first
    /// model that fired, if any.
    pub fn process(&mut self, frame: &[i16]) -> Option<usize> {
        let mut fired = None;
        for row in self.scorer.score(frame) {
            for (k, state) in self.models.iter_mut().enumerate() {
                let score = row.get(k).copied().unwrap_or(0.0);
                if score >= state.threshold {
                    state.counter += 1;
                } else {
                    state.counter = state.counter.saturating_sub(1);
                }
                if state.counter >= state.trigger_level {
                    state.counter = 0;
                    if fired.is_none() {
                        fired = Some(k);
                    }
                }
            }
        }
        fired
    }

    /// Clear debounce counters and pipeline state.
    pub fn reset(&mut self) {
        for state in &mut self.models {
            state.counter = 0;
        }
        self.scorer.reset();
    }
}

// -----------------------------------------------------------------------
// onnx: real three-stage pipeline
// -----------------------------------------------------------------------
#[cfg(feature = "onnx")]
mod onnx {
    use super::*;
    use crate::audio::resample::pcm16_to_f32;
    use ort::session::Session;
    use std::path::Path;
    use tracing::{info, warn};

    /// Samples per pipeline chunk (80 ms at 16 kHz).
    const CHUNK_SAMPLES: usize = 1280;

    /// Embedding window fed to each classifier.
    const EMBEDDING_WINDOW: usize = 16;

    pub struct OnnxScorer {
        mel_session: Option<Session>,
        embed_session: Option<Session>,
        classifiers: Vec<Option<Session>>,
        buffer: Vec<f32>,
        embeddings: Vec<Vec<f32>>,
    }

    impl OnnxScorer {
        pub fn load(configs: &[WakeModelConfig], model_dir: &Path) -> Self {
            let load_one = |path: &Path| -> Option<Session> {
                if !path.exists() {
                    warn!("wake model not found: {}", path.display());
                    return None;
                }
                match Session::builder()
                    .and_then(|b| b.with_intra_threads(1))
                    .and_then(|b| b.with_inter_threads(1))
                    .and_then(|b| b.commit_from_file(path))
                {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!("failed to load {}: {e}", path.display());
                        None
                    }
                }
            };

            let mel_session = load_one(&model_dir.join("melspectrogram.onnx"));
            let embed_session = load_one(&model_dir.join("embedding_model.onnx"));
            let classifiers: Vec<Option<Session>> = configs
                .iter()
                .map(|c| load_one(&model_dir.join(format!("{}.onnx", c.model_id))))
                .collect();

            let loaded = mel_session.is_some()
                && embed_session.is_some()
                && classifiers.iter().all(|c| c.is_some());
            if loaded {
                info!(models = configs.len(), "wake-word pipeline loaded");
            } else {
                warn!("wake-word pipeline incomplete — detection disabled");
            }

            Self {
                mel_session,
                embed_session,
                classifiers,
                buffer: Vec::new(),
                embeddings: Vec::new(),
            }
        }

        fn run_chunk(&mut self, chunk: &[f32]) -> Result<Vec<f32>, String> {
            let mel_session = self.mel_session.as_mut().ok_or("mel model not loaded")?;

            let audio_input =
                ort::value::Value::from_array(([1, chunk.len()], chunk.to_vec()))
                    .map_err(|e| format!("mel input: {e}"))?;
            let mel_outputs = mel_session
                .run(ort::inputs!["input" => audio_input])
                .map_err(|e| format!("mel inference: {e}"))?;
            let (mel_shape, mel_data) = mel_outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| format!("extract mel: {e}"))?;
            let mel_shape: Vec<i64> = mel_shape.to_vec();
            let mel_data = mel_data.to_vec();
            drop(mel_outputs);

            let embed_session = self.embed_session.as_mut().ok_or("embedding model not loaded")?;
            let embed_input = ort::value::Value::from_array((mel_shape, mel_data))
                .map_err(|e| format!("embed input: {e}"))?;
            let embed_outputs = embed_session
                .run(ort::inputs!["input" => embed_input])
                .map_err(|e| format!("embed inference: {e}"))?;
            let embedding: Vec<f32> = {
                let (_shape, data) = embed_outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| format!("extract embedding: {e}"))?;
                data.to_vec()
            };
            drop(embed_outputs);

            self.embeddings.push(embedding);
            if self.embeddings.len() > EMBEDDING_WINDOW {
                let excess = self.embeddings.len() - EMBEDDING_WINDOW;
                self.embeddings.drain(..excess);
            }
            if self.embeddings.len() < EMBEDDING_WINDOW {
                // Warm-up: not enough history for the classifiers yet.
                return Ok(vec![0.0; self.classifiers.len()]);
            }

            let embed_dim = self.embeddings[0].len();
            let flat: Vec<f32> = self
                .embeddings
                .iter()
                .flat_map(|e| e.iter().copied())
                .collect();

            let mut scores = Vec::with_capacity(self.classifiers.len());
            for classifier in self.classifiers.iter_mut() {
                let Some(session) = classifier.as_mut() else {
                    scores.push(0.0);
                    continue;
                };
                let input = ort::value::Value::from_array((
                    [1, EMBEDDING_WINDOW, embed_dim],
                    flat.clone(),
                ))
                .map_err(|e| format!("classifier input: {e}"))?;
                let outputs = session
                    .run(ort::inputs!["input" => input])
                    .map_err(|e| format!("classifier inference: {e}"))?;
                let score = {
                    let (_shape, data) = outputs[0]
                        .try_extract_tensor::<f32>()
                        .map_err(|e| format!("extract score: {e}"))?;
                    data.first().copied().unwrap_or(0.0)
                };
                scores.push(score);
            }
            Ok(scores)
        }
    }

    impl WakeScorer for OnnxScorer {
        fn score(&mut self, frame: &[i16]) -> Vec<Vec<f32>> {
            if self.mel_session.is_none() || self.embed_session.is_none() {
                return Vec::new();
            }
            self.buffer.extend(pcm16_to_f32(frame));

            let mut rows = Vec::new();
            while self.buffer.len() >= CHUNK_SAMPLES {
                let chunk: Vec<f32> = self.buffer.drain(..CHUNK_SAMPLES).collect();
                match self.run_chunk(&chunk) {
                    Ok(scores) => rows.push(scores),
                    Err(e) => {
                        warn!("wake pipeline error: {e}");
                    }
                }
            }
            rows
        }

        fn reset(&mut self) {
            self.buffer.clear();
            self.embeddings.clear();
        }
    }
}

// -----------------------------------------------------------------------
// Stub: no onnx feature — never fires
// -----------------------------------------------------------------------
#[cfg(not(feature = "onnx"))]
mod onnx {
    use super::*;
    use std::path::Path;
    use tracing::warn;

    pub struct OnnxScorer;

    impl OnnxScorer {
        pub fn load(_configs: &[WakeModelConfig], _model_dir: &Path) -> Self {
            warn!("wake-word detection not available (onnx feature disabled)");
            Self
        }
    }

    impl WakeScorer for OnnxScorer {
        fn score(&mut self, _frame: &[i16]) -> Vec<Vec<f32>> {
            Vec::new()
        }

        fn reset(&mut self) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted scorer: one pre-programmed score row per frame.
    struct ScriptedScorer {
        rows: VecDeque<Vec<f32>>,
        resets: usize,
    }

    impl ScriptedScorer {
        fn new(rows: Vec<Vec<f32>>) -> Self {
            Self {
                rows: rows.into(),
                resets: 0,
            }
        }
    }

    impl WakeScorer for ScriptedScorer {
        fn score(&mut self, _frame: &[i16]) -> Vec<Vec<f32>> {
            self.rows.pop_front().map(|r| vec![r]).unwrap_or_default()
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn engine_with(rows: Vec<Vec<f32>>, configs: &[WakeModelConfig]) -> WakeEngine {
        WakeEngine::new(configs, Box::new(ScriptedScorer::new(rows)))
    }

    fn single_model(threshold: f32, trigger_level: u32) -> Vec<WakeModelConfig> {
        vec![WakeModelConfig {
            model_id: "hey_test".into(),
            threshold,
            trigger_level,
        }]
    }

    #[test]
    fn fires_on_trigger_level_th_frame_inclusive() {
        // Scores exactly at the threshold count towards activation.
        let rows = vec![vec![0.5], vec![0.5], vec![0.5]];
        let mut engine = engine_with(rows, &single_model(0.5, 3));
        let frame = [0i16; 512];
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), Some(0));
    }

    #[test]
    fn one_frame_short_does_not_fire() {
        let rows = vec![vec![0.9], vec![0.9], vec![0.0]];
        let mut engine = engine_with(rows, &single_model(0.5, 3));
        let frame = [0i16; 512];
        for _ in 0..3 {
            assert_eq!(engine.process(&frame), None);
        }
    }

    #[test]
    fn sliding_count_survives_a_dip() {
        // hit hit miss hit hit → counters 1 2 1 2 3 with trigger 3.
        let rows = vec![vec![0.9], vec![0.9], vec![0.1], vec![0.9], vec![0.9]];
        let mut engine = engine_with(rows, &single_model(0.5, 3));
        let frame = [0i16; 512];
        let results: Vec<_> = (0..5).map(|_| engine.process(&frame)).collect();
        assert_eq!(results, vec![None, None, None, None, Some(0)]);
    }

    #[test]
    fn models_do_not_interfere() {
        let configs = vec![
            WakeModelConfig {
                model_id: "a".into(),
                threshold: 0.5,
                trigger_level: 2,
            },
            WakeModelConfig {
                model_id: "b".into(),
                threshold: 0.5,
                trigger_level: 2,
            },
        ];
        // Model b scores high while a stays silent.
        let rows = vec![vec![0.0, 0.9], vec![0.0, 0.9]];
        let mut engine = engine_with(rows, &configs);
        let frame = [0i16; 512];
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), Some(1));
        assert_eq!(engine.model_name(1), "b");
    }

    #[test]
    fn firing_resets_the_counter() {
        let rows = vec![vec![0.9], vec![0.9], vec![0.9], vec![0.9]];
        let mut engine = engine_with(rows, &single_model(0.5, 2));
        let frame = [0i16; 512];
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), Some(0));
        // Counter restarted: the next fire needs two more hits.
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), Some(0));
    }

    #[test]
    fn reset_clears_counters() {
        let rows = vec![vec![0.9], vec![0.9], vec![0.9]];
        let mut engine = engine_with(rows, &single_model(0.5, 2));
        let frame = [0i16; 512];
        assert_eq!(engine.process(&frame), None);
        engine.reset();
        assert_eq!(engine.process(&frame), None);
        assert_eq!(engine.process(&frame), Some(0));
    }

    #[test]
    fn buffering_steps_may_yield_nothing() {
        let mut engine = engine_with(vec![], &single_model(0.5, 1));
        assert_eq!(engine.process(&[0i16; 512]), None);
    }
}
