//! Transcript rejection filters.
//!
//! Speech recognizers emit a small set of stock phrases when fed silence or
//! noise. A transcript is rejected when its no-speech probability or token
//! log-probability cross the configured thresholds, or when the normalized
//! text exactly matches a known hallucination.

/// Phrases Whisper-family models produce on silence/noise (English + German).
const HALLUCINATION_PHRASES: &[&str] = &[
    // English
    "thank you for watching",
    "thanks for watching",
    "subscribe to my channel",
    "please subscribe",
    "like and subscribe",
    "see you in the next video",
    "see you next time",
    "bye bye",
    "thank you",
    "thanks for listening",
    "the end",
    "you",
    "i'm sorry",
    // German
    "danke fürs zuschauen",
    "danke für's zuschauen",
    "vielen dank fürs zuschauen",
    "bis zum nächsten mal",
    "tschüss",
    "untertitel von stephanie geiges",
    "untertitel der amara.org-community",
    "untertitel im auftrag des zdf für funk",
];

/// Check a transcript against the rejection rules. Returns the rejection
/// reason, or `None` when the transcript is acceptable.
pub fn check_hallucination(
    text: &str,
    no_speech_prob: f64,
    avg_logprob: f64,
    no_speech_threshold: f64,
    logprob_threshold: f64,
) -> Option<String> {
    if no_speech_prob >= no_speech_threshold {
        return Some(format!("no_speech_prob={no_speech_prob:.2}"));
    }
    if avg_logprob < logprob_threshold {
        return Some(format!("avg_logprob={avg_logprob:.2}"));
    }

    let normalized = text
        .trim()
        .to_lowercase()
        .trim_end_matches(['.', '!', '?', ','])
        .to_string();
    if HALLUCINATION_PHRASES.contains(&normalized.as_str()) {
        return Some("hallucination_blocklist".to_string());
    }

    None
}
