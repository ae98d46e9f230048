//! Wake-phrase detection adapter.
//!
//! The detector wraps a streaming scoring model behind the `WakeModel`
//! trait: feed fixed-size frames, get a confidence score back. Detection is
//! a simple threshold on the score; `reset` clears the model's accumulators
//! so a detection does not immediately re-trigger.
//!
//! The `onnx` feature provides a 3-stage ONNX pipeline
//! (mel spectrogram -> embedding -> classifier). Without it the model is
//! disabled and never triggers.

use crate::config::WakeConfig;

/// Streaming wake-word scorer.
pub trait WakeModel: Send {
    /// Feed one frame, returning the current confidence in [0, 1].
    fn score(&mut self, frame: &[i16]) -> f32;

    /// Clear internal accumulators.
    fn reset(&mut self);
}

/// Threshold adapter over a boxed scoring model.
pub struct WakeDetector {
    model: Box<dyn WakeModel>,
    threshold: f32,
}

impl WakeDetector {
    /// Build the detector from configuration, loading the ONNX pipeline when
    /// available and falling back to a disabled model otherwise.
    pub fn new(config: &WakeConfig) -> Self {
        Self {
            model: load_model(config),
            threshold: config.threshold,
        }
    }

    /// Build the detector around an explicit model (used by tests and
    /// alternative deployments).
    pub fn with_model(model: Box<dyn WakeModel>, threshold: f32) -> Self {
        Self { model, threshold }
    }

    /// Feed a frame; returns `(detected, score)`.
    pub fn process(&mut self, frame: &[i16]) -> (bool, f32) {
        let score = self.model.score(frame);
        (score >= self.threshold, score)
    }

    /// Clear model state after a detection to prevent re-triggering.
    pub fn reset(&mut self) {
        self.model.reset();
    }
}

/// Model that never detects anything.
struct DisabledWakeModel;

impl WakeModel for DisabledWakeModel {
    fn score(&mut self, _frame: &[i16]) -> f32 {
        0.0
    }

    fn reset(&mut self) {}
}

#[cfg(not(feature = "onnx"))]
fn load_model(_config: &WakeConfig) -> Box<dyn WakeModel> {
    tracing::warn!("wake-word scoring unavailable (onnx feature disabled) — wake detection off");
    Box::new(DisabledWakeModel)
}

#[cfg(feature = "onnx")]
fn load_model(config: &WakeConfig) -> Box<dyn WakeModel> {
    match onnx::OnnxWakeModel::load(config) {
        Ok(model) => Box::new(model),
        Err(e) => {
            tracing::warn!("failed to load wake model: {e} — wake detection off");
            Box::new(DisabledWakeModel)
        }
    }
}

#[cfg(feature = "onnx")]
mod onnx {
    //! 3-stage streaming pipeline over fixed 1280-sample frames:
    //! mel spectrogram features, embedding vectors, and a classifier over a
    //! sliding window of recent embeddings.

    use std::path::{Path, PathBuf};

    use ort::session::Session;
    use tracing::info;

    use super::WakeModel;
    use crate::config::WakeConfig;

    /// Frame size the pipeline consumes (80 ms at 16 kHz).
    const FRAME_SAMPLES: usize = 1_280;

    /// Embeddings the classifier sees at once.
    const EMBEDDING_WINDOW: usize = 16;

    pub struct OnnxWakeModel {
        mel: Session,
        embed: Session,
        classifier: Session,
        buffer: Vec<f32>,
        embeddings: Vec<Vec<f32>>,
    }

    impl OnnxWakeModel {
        pub fn load(config: &WakeConfig) -> anyhow::Result<Self> {
            let dir = PathBuf::from(&config.model_dir);
            let mel_path = dir.join("melspectrogram.onnx");
            let embed_path = dir.join("embedding_model.onnx");
            let classifier_path = dir.join(format!("{}.onnx", config.model_name));

            for path in [&mel_path, &embed_path, &classifier_path] {
                if !path.exists() {
                    anyhow::bail!("wake model file missing: {}", path.display());
                }
            }

            let model = Self {
                mel: open_session(&mel_path)?,
                embed: open_session(&embed_path)?,
                classifier: open_session(&classifier_path)?,
                buffer: Vec::new(),
                embeddings: Vec::new(),
            };
            info!(model = %config.model_name, "wake-word pipeline loaded");
            Ok(model)
        }

        fn score_frame(&mut self, frame: &[f32]) -> anyhow::Result<f32> {
            let mel_in = ort::value::Value::from_array(([1, FRAME_SAMPLES], frame.to_vec()))
                .map_err(|e| anyhow::anyhow!("mel input: {e}"))?;
            let mel_out = self
                .mel
                .run(ort::inputs!["input" => mel_in])
                .map_err(|e| anyhow::anyhow!("mel inference: {e}"))?;
            let (mel_shape, mel_data) = mel_out[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow::anyhow!("mel output: {e}"))?;

            let embed_in =
                ort::value::Value::from_array((mel_shape.to_vec(), mel_data.to_vec()))
                    .map_err(|e| anyhow::anyhow!("embed input: {e}"))?;
            let embed_out = self
                .embed
                .run(ort::inputs!["input" => embed_in])
                .map_err(|e| anyhow::anyhow!("embed inference: {e}"))?;
            let (_shape, embedding) = embed_out[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow::anyhow!("embed output: {e}"))?;

            self.embeddings.push(embedding.to_vec());
            if self.embeddings.len() > EMBEDDING_WINDOW {
                let excess = self.embeddings.len() - EMBEDDING_WINDOW;
                self.embeddings.drain(..excess);
            }
            if self.embeddings.len() < EMBEDDING_WINDOW {
                return Ok(0.0);
            }

            let dim = self.embeddings[0].len();
            let flat: Vec<f32> = self.embeddings.iter().flatten().copied().collect();
            let cls_in = ort::value::Value::from_array((
                [1, EMBEDDING_WINDOW, dim],
                flat,
            ))
            .map_err(|e| anyhow::anyhow!("classifier input: {e}"))?;
            let cls_out = self
                .classifier
                .run(ort::inputs!["input" => cls_in])
                .map_err(|e| anyhow::anyhow!("classifier inference: {e}"))?;
            let (_shape, scores) = cls_out[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| anyhow::anyhow!("classifier output: {e}"))?;
            Ok(scores.first().copied().unwrap_or(0.0))
        }
    }

    impl WakeModel for OnnxWakeModel {
        fn score(&mut self, frame: &[i16]) -> f32 {
            self.buffer
                .extend(frame.iter().map(|&s| f32::from(s) / 32_768.0));

            let mut max_score = 0.0f32;
            while self.buffer.len() >= FRAME_SAMPLES {
                let chunk: Vec<f32> = self.buffer.drain(..FRAME_SAMPLES).collect();
                match self.score_frame(&chunk) {
                    Ok(score) => max_score = max_score.max(score),
                    Err(e) => tracing::warn!("wake pipeline error: {e}"),
                }
            }
            max_score
        }

        fn reset(&mut self) {
            self.buffer.clear();
            self.embeddings.clear();
        }
    }

    fn open_session(path: &Path) -> anyhow::Result<Session> {
        Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedModel {
        scores: Vec<f32>,
        pos: usize,
        resets: usize,
    }

    impl WakeModel for ScriptedModel {
        fn score(&mut self, _frame: &[i16]) -> f32 {
            let s = self.scores.get(self.pos).copied().unwrap_or(0.0);
            self.pos += 1;
            s
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    #[test]
    fn detects_at_threshold() {
        let model = ScriptedModel {
            scores: vec![0.2, 0.49, 0.5, 0.9],
            pos: 0,
            resets: 0,
        };
        let mut det = WakeDetector::with_model(Box::new(model), 0.5);
        assert_eq!(det.process(&[0; 4]), (false, 0.2));
        assert_eq!(det.process(&[0; 4]), (false, 0.49));
        assert_eq!(det.process(&[0; 4]), (true, 0.5));
        assert_eq!(det.process(&[0; 4]), (true, 0.9));
    }

    #[test]
    fn disabled_model_never_triggers() {
        let mut det = WakeDetector::with_model(Box::new(DisabledWakeModel), 0.0);
        let (detected, score) = det.process(&[1_000; 1_280]);
        // Threshold 0 still fires on score 0; a real config keeps it above 0.
        assert_eq!(score, 0.0);
        assert!(detected);
        let mut det = WakeDetector::with_model(Box::new(DisabledWakeModel), 0.5);
        assert_eq!(det.process(&[1_000; 1_280]), (false, 0.0));
    }
}
