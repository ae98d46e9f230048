//! Soak-run analysis over the metrics JSONL stream.
//!
//! Tails the metrics file, aggregates robustness counters and interaction
//! latencies, and evaluates a pass/fail threshold set so long-running
//! sessions can gate CI-style smoke checks.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

/// Aggregated counters over observed metrics events.
#[derive(Debug, Default, Clone)]
pub struct SoakStats {
    pub events_total: u64,
    pub wake_events: u64,
    pub interactions: u64,
    pub pipeline_errors: u64,
    pub listening_timeouts: u64,
    pub barge_in_events: u64,
    pub audio_frame_drops: u64,
    pub interaction_latencies: Vec<f64>,
}

impl SoakStats {
    pub fn add_event(&mut self, event: &Value) {
        self.events_total += 1;
        match event.get("event").and_then(Value::as_str) {
            Some("pipeline_error") => self.pipeline_errors += 1,
            Some("listening_timeout") => self.listening_timeouts += 1,
            Some("barge_in") => self.barge_in_events += 1,
            Some("wake_detected") => self.wake_events += 1,
            Some("audio_frame_drop") => {
                self.audio_frame_drops += event
                    .get("dropped_frames")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
            Some("interaction_complete") => {
                self.interactions += 1;
                if let Some(latency) = event.get("total_elapsed_s").and_then(Value::as_f64) {
                    self.interaction_latencies.push(latency);
                }
            }
            _ => {}
        }
    }

    pub fn summary(&self) -> String {
        let p50 = percentile(&self.interaction_latencies, 0.50);
        let p95 = percentile(&self.interaction_latencies, 0.95);
        let p99 = percentile(&self.interaction_latencies, 0.99);
        format!(
            "\nSoak Summary\n\
             - events_total: {}\n\
             - wake_events: {}\n\
             - interactions: {}\n\
             - pipeline_errors: {}\n\
             - listening_timeouts: {}\n\
             - barge_in_events: {}\n\
             - audio_frame_drops: {}\n\
             - latency_p50_s: {:.3}\n\
             - latency_p95_s: {:.3}\n\
             - latency_p99_s: {:.3}\n",
            self.events_total,
            self.wake_events,
            self.interactions,
            self.pipeline_errors,
            self.listening_timeouts,
            self.barge_in_events,
            self.audio_frame_drops,
            p50,
            p95,
            p99,
        )
    }
}

/// Pass/fail gates applied at the end of a soak run.
#[derive(Debug, Clone)]
pub struct Thresholds {
    pub min_interactions: u64,
    pub max_pipeline_errors: u64,
    pub max_listening_timeouts: u64,
    pub max_audio_frame_drops: u64,
    pub max_p95_latency_s: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_interactions: 3,
            max_pipeline_errors: 0,
            max_listening_timeouts: 50,
            max_audio_frame_drops: 2_000,
            max_p95_latency_s: 10.0,
        }
    }
}

/// Evaluate the thresholds; an empty result is a pass.
pub fn evaluate_thresholds(stats: &SoakStats, thresholds: &Thresholds) -> Vec<String> {
    let mut failures = Vec::new();
    if stats.interactions < thresholds.min_interactions {
        failures.push(format!(
            "interactions {} < min_interactions {}",
            stats.interactions, thresholds.min_interactions
        ));
    }
    if stats.pipeline_errors > thresholds.max_pipeline_errors {
        failures.push(format!(
            "pipeline_errors {} > max_pipeline_errors {}",
            stats.pipeline_errors, thresholds.max_pipeline_errors
        ));
    }
    if stats.listening_timeouts > thresholds.max_listening_timeouts {
        failures.push(format!(
            "listening_timeouts {} > max_listening_timeouts {}",
            stats.listening_timeouts, thresholds.max_listening_timeouts
        ));
    }
    if stats.audio_frame_drops > thresholds.max_audio_frame_drops {
        failures.push(format!(
            "audio_frame_drops {} > max_audio_frame_drops {}",
            stats.audio_frame_drops, thresholds.max_audio_frame_drops
        ));
    }
    let p95 = percentile(&stats.interaction_latencies, 0.95);
    if p95 > thresholds.max_p95_latency_s {
        failures.push(format!(
            "latency_p95_s {:.3} > max_p95_latency_s {}",
            p95, thresholds.max_p95_latency_s
        ));
    }
    failures
}

/// Linear-interpolated percentile; 0 for an empty set.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    if values.len() == 1 {
        return values[0];
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (sorted.len() - 1) as f64 * pct;
    let low = rank.floor() as usize;
    let high = (low + 1).min(sorted.len() - 1);
    let frac = rank - low as f64;
    sorted[low] * (1.0 - frac) + sorted[high] * frac
}

/// Read JSONL events appended since `offset`; returns the events and the
/// new offset. Malformed or non-object lines are skipped.
pub fn read_new_events(path: &Path, offset: u64) -> std::io::Result<(Vec<Value>, u64)> {
    let Ok(file) = std::fs::File::open(path) else {
        // Missing file is "nothing new yet", not an error.
        return Ok((Vec::new(), offset));
    };
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;

    let mut events = Vec::new();
    let mut new_offset = offset;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            break;
        }
        // Only consume complete lines; a partial tail is re-read next poll.
        if !line.ends_with('\n') {
            break;
        }
        new_offset += read as u64;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.is_object() {
                events.push(value);
            }
        }
    }
    Ok((events, new_offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn stats_from(events: &[Value]) -> SoakStats {
        let mut stats = SoakStats::default();
        for e in events {
            stats.add_event(e);
        }
        stats
    }

    #[test]
    fn counters_aggregate_by_event_kind() {
        let stats = stats_from(&[
            serde_json::json!({"event": "wake_detected", "score": 0.9}),
            serde_json::json!({"event": "barge_in"}),
            serde_json::json!({"event": "pipeline_error", "stage": "llm"}),
            serde_json::json!({"event": "listening_timeout"}),
            serde_json::json!({"event": "audio_frame_drop", "dropped_frames": 12}),
            serde_json::json!({"event": "audio_frame_drop", "dropped_frames": 3}),
            serde_json::json!({"event": "interaction_complete", "total_elapsed_s": 2.5}),
            serde_json::json!({"event": "stt_complete"}),
        ]);
        assert_eq!(stats.events_total, 8);
        assert_eq!(stats.wake_events, 1);
        assert_eq!(stats.barge_in_events, 1);
        assert_eq!(stats.pipeline_errors, 1);
        assert_eq!(stats.listening_timeouts, 1);
        assert_eq!(stats.audio_frame_drops, 15);
        assert_eq!(stats.interactions, 1);
        assert_eq!(stats.interaction_latencies, vec![2.5]);
    }

    #[test]
    fn percentile_interpolates() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 4.0);
        assert!((percentile(&values, 0.5) - 2.5).abs() < 1e-9);
        assert_eq!(percentile(&[], 0.95), 0.0);
        assert_eq!(percentile(&[7.0], 0.95), 7.0);
    }

    #[test]
    fn thresholds_pass_on_healthy_run() {
        let mut stats = SoakStats::default();
        for _ in 0..5 {
            stats.add_event(
                &serde_json::json!({"event": "interaction_complete", "total_elapsed_s": 1.0}),
            );
        }
        assert!(evaluate_thresholds(&stats, &Thresholds::default()).is_empty());
    }

    #[test]
    fn thresholds_catch_each_violation() {
        let stats = SoakStats {
            interactions: 1,
            pipeline_errors: 2,
            listening_timeouts: 100,
            audio_frame_drops: 5_000,
            interaction_latencies: vec![20.0, 21.0, 22.0],
            ..SoakStats::default()
        };
        let failures = evaluate_thresholds(&stats, &Thresholds::default());
        assert_eq!(failures.len(), 5);
        assert!(failures[0].contains("interactions"));
        assert!(failures[1].contains("pipeline_errors"));
        assert!(failures[4].contains("latency_p95_s"));
    }

    #[test]
    fn tail_reads_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"event": "wake_detected"}}"#).unwrap();
        writeln!(f, "not json").unwrap();
        f.flush().unwrap();

        let (events, offset) = read_new_events(&path, 0).unwrap();
        assert_eq!(events.len(), 1);

        // Nothing new: same offset, no events.
        let (events, offset2) = read_new_events(&path, offset).unwrap();
        assert!(events.is_empty());
        assert_eq!(offset2, offset);

        // A partial line is left for the next poll.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, r#"{{"event": "barge"#).unwrap();
        f.flush().unwrap();
        let (events, offset3) = read_new_events(&path, offset).unwrap();
        assert!(events.is_empty());
        assert_eq!(offset3, offset);

        writeln!(f, r#"_in"}}"#).unwrap();
        f.flush().unwrap();
        let (events, _) = read_new_events(&path, offset3).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "barge_in");
    }

    #[test]
    fn missing_file_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (events, offset) =
            read_new_events(&dir.path().join("absent.jsonl"), 0).unwrap();
        assert!(events.is_empty());
        assert_eq!(offset, 0);
    }
}
