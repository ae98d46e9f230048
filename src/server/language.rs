//! Response language detection for TTS voice selection.
//!
//! A lightweight text-based English/German switch: German-specific
//! characters or any member of a closed German function-word set mark the
//! text as German; anything else uses the fallback when valid.

const DE_CHARS: &[char] = &['ä', 'ö', 'ü', 'ß', 'Ä', 'Ö', 'Ü'];

const DE_STRONG_WORDS: &[&str] = &[
    "ich", "und", "der", "das", "ist", "ein", "eine", "nicht", "auf", "mit", "den", "dem",
    "sich", "von", "für", "aber", "wenn", "nur", "noch", "nach", "auch", "schon", "dann",
    "kann", "wir", "uns", "ihr", "wird", "oder", "sind", "bei", "haben", "hatte", "habe",
    "dir", "sehr", "hier", "diese", "dieser", "geht", "gibt", "bitte", "gerne", "danke",
    "jetzt", "kein", "keine", "mein", "meine", "dein", "immer", "dort", "denn", "weil",
];

/// Detect whether `text` is German or English. Returns "de" or "en";
/// an unknown fallback degrades to "en".
pub fn detect_response_language(text: &str, fallback: Option<&str>) -> &'static str {
    if text.chars().any(|c| DE_CHARS.contains(&c)) {
        return "de";
    }

    let has_german_word = text
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| ".,!?;:\"'()[]".contains(c)))
        .any(|w| DE_STRONG_WORDS.contains(&w));
    if has_german_word {
        return "de";
    }

    match fallback.map(str::to_lowercase).as_deref() {
        Some("de") => "de",
        Some("en") => "en",
        _ => "en",
    }
}
