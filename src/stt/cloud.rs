//! Whisper-compatible HTTP transcription backend.
//!
//! Uploads the utterance as a 16-bit PCM WAV via multipart and asks for the
//! verbose JSON response, which carries the per-segment confidence signals
//! the hallucination filters need.

use std::time::Instant;

use reqwest::multipart;
use serde::Deserialize;
use tracing::debug;

use super::Transcript;
use crate::config::SttConfig;

/// Environment variable holding the optional bearer token for the endpoint.
const API_KEY_ENV: &str = "STT_API_KEY";

pub struct HttpStt {
    endpoint: String,
    model: String,
    language: Option<String>,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct VerboseResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    avg_logprob: f64,
    #[serde(default)]
    no_speech_prob: f64,
}

impl HttpStt {
    pub fn new(config: &SttConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model_size.clone(),
            language: config.language.clone(),
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    pub async fn transcribe(
        &self,
        audio: &[i16],
        sample_rate: u32,
    ) -> anyhow::Result<Transcript> {
        let duration_s = audio.len() as f64 / f64::from(sample_rate);
        let wav = encode_wav(audio, sample_rate);
        debug!(bytes = wav.len(), endpoint = %self.endpoint, "sending audio to STT endpoint");

        let t0 = Instant::now();

        let file_part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", file_part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let mut req = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("STT endpoint error {status}: {body}");
        }

        let parsed: VerboseResponse = resp.json().await?;
        let transcription_time_s = t0.elapsed().as_secs_f64();

        let (avg_logprob, no_speech_prob) = if parsed.segments.is_empty() {
            (0.0, 0.0)
        } else {
            let n = parsed.segments.len() as f64;
            (
                parsed.segments.iter().map(|s| s.avg_logprob).sum::<f64>() / n,
                parsed.segments.iter().map(|s| s.no_speech_prob).sum::<f64>() / n,
            )
        };

        Ok(Transcript {
            text: parsed.text.trim().to_string(),
            language: parsed.language,
            duration_s: parsed.duration.unwrap_or(duration_s),
            transcription_time_s,
            avg_logprob,
            no_speech_prob,
        })
    }
}

/// Encode int16 samples as a 16-bit PCM mono WAV file.
fn encode_wav(audio: &[i16], sample_rate: u32) -> Vec<u8> {
    let num_samples = audio.len() as u32;
    let bytes_per_sample: u16 = 2;
    let num_channels: u16 = 1;
    let data_size = num_samples * u32::from(bytes_per_sample);
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * u32::from(num_channels) * u32::from(bytes_per_sample);
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&(num_channels * bytes_per_sample).to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in audio {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}
