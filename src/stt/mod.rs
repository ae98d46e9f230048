//! Speech-to-text adapters.
//!
//! Enum dispatch over the available backends:
//! - `Http`: whisper-compatible transcription endpoint (multipart WAV
//!   upload, verbose JSON response).
//! - `Whisper`: local whisper.cpp inference behind the `whisper` feature.

pub mod cloud;
pub mod filters;
#[cfg(feature = "whisper")]
pub mod whisper;

use crate::config::SttConfig;

/// Transcription result with the confidence signals the rejection filters
/// consume.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    /// BCP-47-ish language code reported by the model, when detected.
    pub language: Option<String>,
    /// Input audio duration in seconds.
    pub duration_s: f64,
    /// Wall-clock transcription time in seconds.
    pub transcription_time_s: f64,
    /// Mean token log-probability across segments.
    pub avg_logprob: f64,
    /// Probability that the audio contains no speech.
    pub no_speech_prob: f64,
}

/// Enum dispatch over STT backends (avoids dyn-compatibility issues with
/// async trait methods).
pub enum SttAdapter {
    Http(cloud::HttpStt),
    #[cfg(feature = "whisper")]
    Whisper(whisper::WhisperStt),
}

impl SttAdapter {
    /// Transcribe int16 mono audio at `sample_rate`.
    pub async fn transcribe(
        &self,
        audio: &[i16],
        sample_rate: u32,
    ) -> anyhow::Result<Transcript> {
        match self {
            Self::Http(engine) => engine.transcribe(audio, sample_rate).await,
            #[cfg(feature = "whisper")]
            Self::Whisper(engine) => engine.transcribe(audio, sample_rate).await,
        }
    }
}

/// Create an STT engine from configuration.
pub fn create_stt_engine(config: &SttConfig) -> anyhow::Result<SttAdapter> {
    match config.engine.as_str() {
        "http" => Ok(SttAdapter::Http(cloud::HttpStt::new(config))),
        #[cfg(feature = "whisper")]
        "whisper" => Ok(SttAdapter::Whisper(whisper::WhisperStt::new(config)?)),
        #[cfg(not(feature = "whisper"))]
        "whisper" => anyhow::bail!(
            "local whisper STT is not available (compile with --features whisper)"
        ),
        other => anyhow::bail!("unknown STT engine: {other}"),
    }
}
