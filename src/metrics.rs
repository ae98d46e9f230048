//! Append-only JSONL metrics.
//!
//! Events buffer in memory and flush to disk every `flush_interval` logs.
//! The logger never raises to its caller: flush failures drop the buffer
//! (bounding memory) and warn at most once per 30 seconds.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tracing::warn;

use crate::config::MetricsConfig;
use crate::llm::ChatOutcome;
use crate::stt::Transcript;

const WARN_INTERVAL_S: f64 = 30.0;

struct MetricsState {
    buffer: Vec<String>,
    event_count: u64,
    last_warn: Option<Instant>,
}

/// Thread-safe JSONL event logger.
pub struct MetricsLogger {
    enabled: bool,
    file_path: PathBuf,
    flush_interval: u64,
    state: Mutex<MetricsState>,
}

impl MetricsLogger {
    pub fn new(config: &MetricsConfig) -> Self {
        let file_path = PathBuf::from(&config.file);
        let flush_interval = config.flush_interval.max(1) as u64;

        let mut enabled = config.enabled;
        if enabled {
            if let Some(parent) = file_path.parent() {
                if !parent.as_os_str().is_empty() && std::fs::create_dir_all(parent).is_err() {
                    warn!(path = %file_path.display(), "metrics path is not writable; disabling metrics");
                    enabled = false;
                }
            }
        }

        Self {
            enabled,
            file_path,
            flush_interval,
            state: Mutex::new(MetricsState {
                buffer: Vec::new(),
                event_count: 0,
                last_warn: None,
            }),
        }
    }

    /// Disabled logger for components that run without metrics.
    pub fn disabled() -> Self {
        Self::new(&MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        })
    }

    /// Log an event with a wall-clock timestamp. `fields` must be a JSON
    /// object; its entries are merged into the line.
    pub fn log(&self, event_type: &str, fields: Value) {
        if !self.enabled {
            return;
        }

        let mut entry = serde_json::Map::new();
        entry.insert(
            "timestamp".to_string(),
            Value::from(chrono::Utc::now().timestamp_micros() as f64 / 1e6),
        );
        entry.insert("event".to_string(), Value::from(event_type));
        match fields {
            Value::Object(map) => entry.extend(map),
            Value::Null => {}
            other => {
                // Shape error in the caller; drop the payload, keep the event.
                warn!(event = event_type, ?other, "metrics fields must be an object");
            }
        }

        let line = Value::Object(entry).to_string();

        let mut state = self.state.lock().unwrap();
        state.buffer.push(line);
        state.event_count += 1;
        if state.event_count % self.flush_interval == 0 {
            self.flush_locked(&mut state);
        }
    }

    /// Write all buffered events to disk.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        self.flush_locked(&mut state);
    }

    fn flush_locked(&self, state: &mut MetricsState) {
        if state.buffer.is_empty() {
            return;
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .and_then(|mut f| {
                for line in &state.buffer {
                    writeln!(f, "{line}")?;
                }
                Ok(())
            });
        // Dropped either way: a failed flush must not grow memory unboundedly.
        state.buffer.clear();
        if let Err(e) = result {
            let warn_due = state
                .last_warn
                .map_or(true, |t| t.elapsed().as_secs_f64() >= WARN_INTERVAL_S);
            if warn_due {
                state.last_warn = Some(Instant::now());
                warn!(path = %self.file_path.display(), "metrics flush failed, dropping buffered events: {e}");
            }
        }
    }
}

/// STT metrics payload; transcript text included only when opted in.
pub fn stt_metrics_payload(transcript: &Transcript, include_text: bool) -> Value {
    let mut payload = serde_json::json!({
        "language": transcript.language,
        "duration_s": transcript.duration_s,
        "transcription_time_s": transcript.transcription_time_s,
        "avg_logprob": transcript.avg_logprob,
        "no_speech_prob": transcript.no_speech_prob,
        "text_chars": transcript.text.chars().count(),
    });
    if include_text {
        payload["text"] = Value::from(transcript.text.clone());
    }
    payload
}

/// LLM metrics payload; response text included only when opted in.
pub fn llm_metrics_payload(outcome: &ChatOutcome, include_text: bool) -> Value {
    let mut payload = serde_json::json!({
        "model": outcome.model,
        "elapsed_s": outcome.elapsed_s,
        "ttft_s": outcome.ttft_s,
        "text_chars": outcome.text.chars().count(),
    });
    if include_text {
        payload["text"] = Value::from(outcome.text.clone());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger_at(path: &std::path::Path, flush_interval: i64) -> MetricsLogger {
        MetricsLogger::new(&MetricsConfig {
            enabled: true,
            file: path.to_string_lossy().into_owned(),
            flush_interval,
            log_transcripts: false,
            log_llm_text: false,
        })
    }

    fn read_lines(path: &std::path::Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn events_flush_in_order_with_timestamp_and_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let logger = logger_at(&path, 1);
        logger.log("wake_detected", serde_json::json!({"score": 0.9}));
        logger.log("barge_in", Value::Null);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "wake_detected");
        assert_eq!(lines[0]["score"], 0.9);
        assert!(lines[0]["timestamp"].as_f64().unwrap() > 1e9);
        assert_eq!(lines[1]["event"], "barge_in");
    }

    #[test]
    fn buffering_respects_flush_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let logger = logger_at(&path, 3);
        logger.log("a", Value::Null);
        logger.log("b", Value::Null);
        assert!(read_lines(&path).is_empty());
        logger.log("c", Value::Null);
        assert_eq!(read_lines(&path).len(), 3);
    }

    #[test]
    fn flush_interval_is_coerced_to_at_least_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let logger = logger_at(&path, 0);
        logger.log("a", Value::Null);
        assert_eq!(read_lines(&path).len(), 1);
        let logger = logger_at(&path, -5);
        logger.log("b", Value::Null);
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[test]
    fn disabled_logger_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let logger = MetricsLogger::new(&MetricsConfig {
            enabled: false,
            file: path.to_string_lossy().into_owned(),
            ..MetricsConfig::default()
        });
        logger.log("a", Value::Null);
        logger.flush();
        assert!(!path.exists());
    }

    #[test]
    fn write_errors_do_not_panic_and_drop_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        // The metrics "file" is a directory: every open fails.
        let logger = logger_at(dir.path(), 1);
        logger.log("a", Value::Null);
        logger.log("b", Value::Null);
        logger.flush();
    }

    #[test]
    fn privacy_payloads_expose_counts_not_text() {
        let transcript = Transcript {
            text: "secret words".to_string(),
            language: Some("en".to_string()),
            duration_s: 1.0,
            transcription_time_s: 0.5,
            avg_logprob: -0.2,
            no_speech_prob: 0.1,
        };
        let payload = stt_metrics_payload(&transcript, false);
        assert_eq!(payload["text_chars"], 12);
        assert!(payload.get("text").is_none());
        let payload = stt_metrics_payload(&transcript, true);
        assert_eq!(payload["text"], "secret words");

        let outcome = ChatOutcome {
            text: "reply".to_string(),
            model: "m".to_string(),
            elapsed_s: 1.0,
            ttft_s: 0.2,
        };
        let payload = llm_metrics_payload(&outcome, false);
        assert_eq!(payload["text_chars"], 5);
        assert!(payload.get("text").is_none());
    }
}
