//! Structured configuration for the client, server, and soak monitor.
//!
//! All groups and keys are optional; missing values fall back to the
//! documented defaults. Configuration is read from a JSON file passed via
//! `--config` (or skipped entirely, yielding pure defaults).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

/// Top-level configuration shared by the client and server binaries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub earcon: EarconConfig,
    pub wake: WakeConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub conversation: ConversationConfig,
    pub server: ServerConfig,
    pub protocol: ProtocolConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub blocksize: usize,
    pub ring_buffer_seconds: f64,
    pub capture_drop_report_s: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            blocksize: 1_280,
            ring_buffer_seconds: 10.0,
            capture_drop_report_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// webrtc-vad aggressiveness, 0 (permissive) to 3 (strict).
    pub aggressiveness: u8,
    /// Sub-frame duration fed to the classifier: 10, 20, or 30 ms.
    pub frame_duration_ms: u32,
    /// RMS gate below which a frame is never speech.
    pub energy_threshold: f64,
    pub silence_timeout_ms: u64,
    pub speech_onset_frames: usize,
    pub barge_in_enabled: bool,
    pub barge_in_frames: usize,
    pub barge_in_grace_s: f64,
    pub follow_up_grace_s: f64,
    pub listening_timeout_s: f64,
    pub max_utterance_s: f64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            aggressiveness: 2,
            frame_duration_ms: 20,
            energy_threshold: 300.0,
            silence_timeout_ms: 1_200,
            speech_onset_frames: 3,
            barge_in_enabled: false,
            barge_in_frames: 8,
            barge_in_grace_s: 1.0,
            follow_up_grace_s: 0.3,
            listening_timeout_s: 8.0,
            max_utterance_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EarconConfig {
    /// Wake-cue frequency in Hz.
    pub frequency: f32,
    pub duration_s: f32,
    pub volume: f32,
}

impl Default for EarconConfig {
    fn default() -> Self {
        Self {
            frequency: 880.0,
            duration_s: 0.15,
            volume: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Wake-word classifier model name (resolved under `model_dir`).
    pub model_name: String,
    pub model_dir: String,
    pub threshold: f32,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            model_name: "hey_assistant".to_string(),
            model_dir: "models".to_string(),
            threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// "http" (whisper-compatible endpoint) or "whisper" (local, feature-gated).
    pub engine: String,
    pub model_size: String,
    pub device: String,
    pub compute_type: String,
    /// Forced transcription language; autodetect when unset.
    pub language: Option<String>,
    pub endpoint: String,
    pub no_speech_threshold: f64,
    pub logprob_threshold: f64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            engine: "http".to_string(),
            model_size: "base".to_string(),
            device: "cpu".to_string(),
            compute_type: "int8".to_string(),
            language: None,
            endpoint: "http://localhost:8080/v1/audio/transcriptions".to_string(),
            no_speech_threshold: 0.6,
            logprob_threshold: -1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub api_base: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub web_search: bool,
    pub warmup_enabled: bool,
    pub timeout_s: u64,
    pub max_retries: u32,
    pub retry_base_delay_s: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            api_base: "https://openrouter.ai/api/v1".to_string(),
            max_tokens: 256,
            temperature: 0.7,
            web_search: false,
            warmup_enabled: true,
            timeout_s: 30,
            max_retries: 2,
            retry_base_delay_s: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// "http" is the only built-in engine.
    pub engine: String,
    pub default_language: String,
    /// Per-language voice table: `{ "en": { "http_voice": "alloy" } }`.
    pub voices: HashMap<String, HashMap<String, String>>,
    /// Silence appended after non-terminal sentences, in seconds.
    pub sentence_silence: f64,
    pub endpoint: String,
    pub model: String,
    pub speed: f64,
    pub sample_rate: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: "http".to_string(),
            default_language: "en".to_string(),
            voices: HashMap::new(),
            sentence_silence: 0.2,
            endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
            model: "tts-1".to_string(),
            speed: 1.0,
            sample_rate: 24_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Maximum retained user+assistant pairs.
    pub max_turns: usize,
    /// Estimated-token budget (total chars / 4).
    pub max_tokens_budget: usize,
    pub follow_up_window_s: f64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            max_tokens_budget: 2_048,
            follow_up_window_s: 7.0,
        }
    }
}

/// Server address and client-side reconnect/outbox tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_min_s: f64,
    pub reconnect_max_s: f64,
    pub offline_send_buffer_size: usize,
    pub offline_send_ttl_s: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            reconnect_min_s: 1.0,
            reconnect_max_s: 30.0,
            offline_send_buffer_size: 200,
            offline_send_ttl_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Declared-vs-actual sample count mismatch ratio above which an
    /// utterance is rejected instead of accepted with a warning.
    pub audio_mismatch_reject_ratio: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            audio_mismatch_reject_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub file: String,
    pub flush_interval: i64,
    pub log_transcripts: bool,
    pub log_llm_text: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            file: "metrics.jsonl".to_string(),
            flush_interval: 10,
            log_transcripts: false,
            log_llm_text: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. A missing `path` yields defaults;
    /// an unreadable or malformed file is a startup error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path.display(), e))?;
        if config.vad.frame_duration_ms != 10
            && config.vad.frame_duration_ms != 20
            && config.vad.frame_duration_ms != 30
        {
            warn!(
                frame_duration_ms = config.vad.frame_duration_ms,
                "vad.frame_duration_ms should be 10, 20, or 30"
            );
        }
        Ok(config)
    }

    /// WebSocket URL the client connects to.
    pub fn server_url(&self) -> String {
        format!("ws://{}:{}/ws", self.server.host, self.server.port)
    }
}
