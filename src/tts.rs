//! Streaming text-to-speech.
//!
//! The engine splits response text into sentences, synthesizes each through
//! the configured backend voice, and emits int16 chunks through a bounded
//! channel so the first sentence plays while later ones are still being
//! synthesized. Non-terminal chunks get a configurable silence tail;
//! synthesis output is clipped to [-1, 1] before int16 conversion.
//!
//! Language routing picks the voice whose language matches the request,
//! falling back to the default language, then to a chained fallback engine,
//! and finally to any supported language chosen deterministically, never
//! recursing through the default (which may itself be unsupported).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;

/// Environment variable holding the optional bearer token for the endpoint.
const API_KEY_ENV: &str = "TTS_API_KEY";

/// Voice-table key naming the HTTP backend voice for a language.
const HTTP_VOICE_KEY: &str = "http_voice";

/// One synthesized audio chunk bound for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct TtsChunk {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub is_last: bool,
}

/// Synthesis backends (enum dispatch, matching the STT adapter shape).
pub enum TtsBackend {
    Http(HttpTts),
    #[cfg(test)]
    Scripted(ScriptedBackend),
}

impl TtsBackend {
    /// Synthesize one sentence with `voice`; returns f32 samples and their
    /// sample rate.
    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<(Vec<f32>, u32)> {
        match self {
            Self::Http(backend) => backend.synthesize(text, voice).await,
            #[cfg(test)]
            Self::Scripted(backend) => backend.synthesize(text, voice),
        }
    }
}

/// Sentence-split streaming synthesizer with per-language voices.
pub struct TtsEngine {
    backend: TtsBackend,
    /// language code -> backend voice name
    voices: HashMap<String, String>,
    default_language: String,
    sentence_silence: f64,
    fallback: Option<Box<TtsEngine>>,
}

impl TtsEngine {
    /// Build the engine from configuration.
    pub fn new(config: &TtsConfig) -> anyhow::Result<Self> {
        match config.engine.as_str() {
            "http" => {}
            other => anyhow::bail!("unknown TTS engine: {other}"),
        }

        let mut voices = HashMap::new();
        for (lang, table) in &config.voices {
            if let Some(voice) = table.get(HTTP_VOICE_KEY) {
                voices.insert(lang.to_lowercase(), voice.clone());
            }
        }
        if voices.is_empty() {
            // No voice table: serve the default language with the backend's
            // stock voice.
            voices.insert(config.default_language.to_lowercase(), "alloy".to_string());
        }
        info!(languages = ?voices.keys().collect::<Vec<_>>(), "TTS voices configured");

        Ok(Self {
            backend: TtsBackend::Http(HttpTts::new(config)),
            voices,
            default_language: config.default_language.to_lowercase(),
            sentence_silence: config.sentence_silence,
            fallback: None,
        })
    }

    #[cfg(test)]
    fn with_backend(
        backend: TtsBackend,
        voices: HashMap<String, String>,
        default_language: &str,
        sentence_silence: f64,
    ) -> Self {
        Self {
            backend,
            voices,
            default_language: default_language.to_string(),
            sentence_silence,
            fallback: None,
        }
    }

    /// Chain an engine that serves languages this one cannot.
    pub fn with_fallback(mut self, fallback: TtsEngine) -> Self {
        self.fallback = Some(Box::new(fallback));
        self
    }

    pub fn supports(&self, language: &str) -> bool {
        self.voices.contains_key(&language.to_lowercase())
    }

    /// Resolve the effective language and voice for a request.
    ///
    /// Unsupported defaults must not cause a retry loop: when neither the
    /// requested nor the default language has a voice, the lexically first
    /// supported language is used.
    fn resolve_voice(&self, language: Option<&str>) -> Option<(String, String)> {
        let requested = language
            .map(str::to_lowercase)
            .unwrap_or_else(|| self.default_language.clone());
        if let Some(voice) = self.voices.get(&requested) {
            return Some((requested, voice.clone()));
        }
        if let Some(voice) = self.voices.get(&self.default_language) {
            return Some((self.default_language.clone(), voice.clone()));
        }
        let mut langs: Vec<&String> = self.voices.keys().collect();
        langs.sort();
        langs
            .first()
            .map(|lang| ((*lang).clone(), self.voices[*lang].clone()))
    }

    /// Synthesize `text` sentence by sentence, sending chunks into `tx`.
    ///
    /// Stops early (without error) when `cancel` is set. The final emitted
    /// chunk carries `is_last = true`; when the last sentence synthesizes to
    /// nothing, an empty terminal chunk marks the boundary.
    pub async fn synthesize_chunks(
        &self,
        text: &str,
        language: Option<&str>,
        tx: &mpsc::Sender<TtsChunk>,
        cancel: &AtomicBool,
    ) -> anyhow::Result<()> {
        // Route to the fallback engine when it serves a language we cannot.
        if let (Some(lang), Some(fallback)) = (language, &self.fallback) {
            if !self.supports(lang) && fallback.supports(lang) {
                debug!(language = lang, "delegating synthesis to fallback engine");
                return Box::pin(fallback.synthesize_chunks(text, language, tx, cancel)).await;
            }
        }

        let Some((lang, voice)) = self.resolve_voice(language) else {
            anyhow::bail!("no TTS voice available");
        };

        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Ok(());
        }

        for (i, sentence) in sentences.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                debug!("TTS synthesis cancelled");
                return Ok(());
            }
            let is_last = i == sentences.len() - 1;

            let (mut samples, sample_rate) = self.backend.synthesize(sentence, &voice).await?;
            if samples.is_empty() {
                if is_last {
                    let _ = tx
                        .send(TtsChunk {
                            samples: Vec::new(),
                            sample_rate,
                            is_last: true,
                        })
                        .await;
                }
                continue;
            }

            if !is_last {
                let silence = (self.sentence_silence * f64::from(sample_rate)) as usize;
                samples.extend(std::iter::repeat(0.0).take(silence));
            }

            let pcm: Vec<i16> = samples
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
                .collect();

            debug!(
                sentence = i,
                samples = pcm.len(),
                language = %lang,
                is_last,
                "TTS chunk synthesized"
            );
            if tx
                .send(TtsChunk {
                    samples: pcm,
                    sample_rate,
                    is_last,
                })
                .await
                .is_err()
            {
                // Receiver gone: the pipeline was torn down.
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Split text into sentences on `.`/`!`/`?` boundaries, keeping the
/// punctuation with the preceding sentence.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.trim().chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let boundary = chars.peek().map_or(true, |next| next.is_whitespace());
            if boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// HTTP speech backend (OpenAI-compatible `/audio/speech`, raw PCM output).
pub struct HttpTts {
    endpoint: String,
    model: String,
    speed: f64,
    sample_rate: u32,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTts {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            speed: config.speed,
            sample_rate: config.sample_rate,
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    async fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<(Vec<f32>, u32)> {
        if text.trim().is_empty() {
            return Ok((Vec::new(), self.sample_rate));
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "speed": self.speed,
            "response_format": "pcm",
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS endpoint error {status}: {body}");
        }

        // Raw little-endian 16-bit mono PCM at the configured rate.
        let bytes = resp.bytes().await?;
        if bytes.len() % 2 != 0 {
            warn!(len = bytes.len(), "TTS endpoint returned odd-length PCM; truncating");
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32_768.0)
            .collect();
        Ok((samples, self.sample_rate))
    }
}

/// Test backend yielding deterministic ramps.
#[cfg(test)]
pub struct ScriptedBackend {
    pub sample_rate: u32,
    /// Samples returned per sentence; empty means "synthesized to nothing".
    pub per_sentence: Vec<Vec<f32>>,
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl ScriptedBackend {
    fn synthesize(&self, text: &str, voice: &str) -> anyhow::Result<(Vec<f32>, u32)> {
        let mut calls = self.calls.lock().unwrap();
        let idx = calls.len();
        calls.push((text.to_string(), voice.to_string()));
        let samples = self
            .per_sentence
            .get(idx % self.per_sentence.len().max(1))
            .cloned()
            .unwrap_or_default();
        Ok((samples, self.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hello there. How are you? Great!"),
            vec!["Hello there.", "How are you?", "Great!"]
        );
    }

    #[test]
    fn keeps_decimals_and_abbrev_points_inside_sentences() {
        // A period not followed by whitespace does not split.
        assert_eq!(split_sentences("Pi is 3.14 exactly."), vec!["Pi is 3.14 exactly."]);
    }

    #[test]
    fn unterminated_tail_is_its_own_sentence() {
        assert_eq!(
            split_sentences("First. second half"),
            vec!["First.", "second half"]
        );
        assert!(split_sentences("   ").is_empty());
    }

    fn engine(per_sentence: Vec<Vec<f32>>, silence_s: f64) -> TtsEngine {
        let backend = TtsBackend::Scripted(ScriptedBackend {
            sample_rate: 100,
            per_sentence,
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let mut voices = HashMap::new();
        voices.insert("en".to_string(), "voice-en".to_string());
        TtsEngine::with_backend(backend, voices, "en", silence_s)
    }

    async fn collect_chunks(
        engine: &TtsEngine,
        text: &str,
        language: Option<&str>,
    ) -> Vec<TtsChunk> {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = AtomicBool::new(false);
        engine
            .synthesize_chunks(text, language, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);
        let mut chunks = Vec::new();
        while let Some(c) = rx.recv().await {
            chunks.push(c);
        }
        chunks
    }

    #[tokio::test]
    async fn one_chunk_per_sentence_with_single_is_last() {
        let eng = engine(vec![vec![0.5; 10]], 0.0);
        let chunks = collect_chunks(&eng, "One. Two. Three.", None).await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.is_last).count(), 1);
        assert!(chunks.last().unwrap().is_last);
    }

    #[tokio::test]
    async fn non_terminal_chunks_get_silence_tail() {
        // 0.1 s of silence at 100 Hz = 10 samples.
        let eng = engine(vec![vec![0.5; 10]], 0.1);
        let chunks = collect_chunks(&eng, "One. Two.", None).await;
        assert_eq!(chunks[0].samples.len(), 20);
        assert!(chunks[0].samples[10..].iter().all(|&s| s == 0));
        assert_eq!(chunks[1].samples.len(), 10);
    }

    #[tokio::test]
    async fn synthesis_output_is_clipped() {
        let eng = engine(vec![vec![2.0, -2.0, 0.0]], 0.0);
        let chunks = collect_chunks(&eng, "Loud.", None).await;
        assert_eq!(chunks[0].samples, vec![32_767, -32_767, 0]);
    }

    #[tokio::test]
    async fn empty_terminal_synthesis_still_marks_the_boundary() {
        let eng = engine(vec![vec![0.5; 4], vec![]], 0.0);
        let chunks = collect_chunks(&eng, "One. Two.", None).await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].samples.is_empty());
        assert!(chunks[1].is_last);
    }

    #[tokio::test]
    async fn cancel_stops_before_next_sentence() {
        let eng = engine(vec![vec![0.5; 4]], 0.0);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = AtomicBool::new(true);
        eng.synthesize_chunks("One. Two.", None, &tx, &cancel)
            .await
            .unwrap();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_language_falls_back_to_default_voice() {
        let eng = engine(vec![vec![0.5; 4]], 0.0);
        let _ = collect_chunks(&eng, "Hallo.", Some("fr")).await;
        let TtsBackend::Scripted(backend) = &eng.backend else {
            unreachable!()
        };
        assert_eq!(backend.calls.lock().unwrap()[0].1, "voice-en");
    }

    #[tokio::test]
    async fn fallback_engine_serves_unsupported_language() {
        let primary = engine(vec![vec![0.5; 4]], 0.0);
        let de_backend = TtsBackend::Scripted(ScriptedBackend {
            sample_rate: 100,
            per_sentence: vec![vec![0.25; 4]],
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let mut de_voices = HashMap::new();
        de_voices.insert("de".to_string(), "voice-de".to_string());
        let fallback = TtsEngine::with_backend(de_backend, de_voices, "de", 0.0);
        let eng = primary.with_fallback(fallback);

        let chunks = collect_chunks(&eng, "Hallo Welt.", Some("de")).await;
        assert_eq!(chunks.len(), 1);
        // ~0.25 amplitude marks the fallback backend.
        assert_eq!(chunks[0].samples[0], (0.25f32 * 32_767.0) as i16);
    }

    #[tokio::test]
    async fn unsupported_default_does_not_recurse() {
        // Engine whose default language has no voice: resolution must land
        // deterministically on a supported language instead of looping.
        let backend = TtsBackend::Scripted(ScriptedBackend {
            sample_rate: 100,
            per_sentence: vec![vec![0.5; 4]],
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let mut voices = HashMap::new();
        voices.insert("en".to_string(), "voice-en".to_string());
        voices.insert("fr".to_string(), "voice-fr".to_string());
        let eng = TtsEngine::with_backend(backend, voices, "de", 0.0);
        let chunks = collect_chunks(&eng, "Bonjour.", Some("it")).await;
        assert_eq!(chunks.len(), 1);
        let TtsBackend::Scripted(backend) = &eng.backend else {
            unreachable!()
        };
        // Lexically first supported language is "en".
        assert_eq!(backend.calls.lock().unwrap()[0].1, "voice-en");
    }
}
