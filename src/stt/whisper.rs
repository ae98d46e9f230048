//! Local whisper.cpp STT via whisper-rs (feature `whisper`).
//!
//! Inference runs on a blocking thread so the reactor never stalls. The
//! binding does not surface a no-speech probability, so the confidence gate
//! for this backend rests on the mean token log-probability and the phrase
//! blocklist.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::info;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use super::Transcript;
use crate::config::SttConfig;

/// Utterances shorter than this (0.4 s at 16 kHz) transcribe as empty.
const MIN_SAMPLES: usize = 6_400;

pub struct WhisperStt {
    ctx: Arc<Mutex<WhisperContext>>,
    language: Option<String>,
}

// SAFETY: WhisperContext access is serialized through the mutex; inference
// never runs concurrently on the same context.
unsafe impl Send for WhisperStt {}
unsafe impl Sync for WhisperStt {}

impl WhisperStt {
    pub fn new(config: &SttConfig) -> anyhow::Result<Self> {
        let model_path = PathBuf::from("models")
            .join(format!("ggml-{}.bin", config.model_size));
        if !model_path.exists() {
            anyhow::bail!("whisper model not found: {}", model_path.display());
        }
        let ctx = WhisperContext::new_with_params(
            model_path.to_str().unwrap_or_default(),
            WhisperContextParameters::default(),
        )
        .map_err(|e| anyhow::anyhow!("failed to load whisper model: {e}"))?;
        info!(model = %model_path.display(), "whisper model loaded");
        Ok(Self {
            ctx: Arc::new(Mutex::new(ctx)),
            language: config.language.clone(),
        })
    }

    pub async fn transcribe(
        &self,
        audio: &[i16],
        sample_rate: u32,
    ) -> anyhow::Result<Transcript> {
        let duration_s = audio.len() as f64 / f64::from(sample_rate);
        let t0 = Instant::now();

        if audio.len() < MIN_SAMPLES {
            return Ok(Transcript {
                text: String::new(),
                language: self.language.clone(),
                duration_s,
                transcription_time_s: 0.0,
                avg_logprob: 0.0,
                no_speech_prob: 0.0,
            });
        }

        let samples: Vec<f32> = audio.iter().map(|&s| f32::from(s) / 32_768.0).collect();
        let ctx = Arc::clone(&self.ctx);
        let language = self.language.clone();

        let (text, avg_logprob) = tokio::task::spawn_blocking(move || {
            let ctx = ctx.lock().unwrap();
            let mut state = ctx
                .create_state()
                .map_err(|e| anyhow::anyhow!("failed to create whisper state: {e}"))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(language.as_deref());
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);
            params.set_no_timestamps(true);

            state
                .full(params, &samples)
                .map_err(|e| anyhow::anyhow!("whisper inference failed: {e}"))?;

            let num_segments = state
                .full_n_segments()
                .map_err(|e| anyhow::anyhow!("failed to get segment count: {e}"))?;

            let mut text = String::new();
            let mut logprob_sum = 0.0f64;
            let mut token_count = 0u64;
            for seg in 0..num_segments {
                if let Ok(seg_text) = state.full_get_segment_text(seg) {
                    if !text.is_empty() {
                        text.push(' ');
                    }
                    text.push_str(seg_text.trim());
                }
                if let Ok(n_tokens) = state.full_n_tokens(seg) {
                    for tok in 0..n_tokens {
                        if let Ok(p) = state.full_get_token_prob(seg, tok) {
                            logprob_sum += f64::from(p.max(1e-10)).ln();
                            token_count += 1;
                        }
                    }
                }
            }
            let avg_logprob = if token_count > 0 {
                logprob_sum / token_count as f64
            } else {
                0.0
            };
            Ok::<_, anyhow::Error>((text, avg_logprob))
        })
        .await
        .map_err(|e| anyhow::anyhow!("whisper task panicked: {e}"))??;

        Ok(Transcript {
            text,
            language: self.language.clone(),
            duration_s,
            transcription_time_s: t0.elapsed().as_secs_f64(),
            avg_logprob,
            no_speech_prob: 0.0,
        })
    }
}
