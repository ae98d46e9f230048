//! Pre-TTS response cleanup.
//!
//! LLM responses routinely carry citations, URLs, and markdown that sound
//! terrible when spoken. `clean_for_tts` strips them deterministically and
//! is idempotent, so re-cleaning stored text is safe.

use std::sync::LazyLock;

use regex::Regex;

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("sanitizer regex"));
    };
}

re!(PRIVATE_USE_SPAN, "(?s)\u{E200}.*?\u{E201}");
re!(CJK_BRACKETS, "[\u{3010}\u{3016}][^\u{3011}\u{3017}]*[\u{3011}\u{3017}]");
re!(MD_LINK, r"\[([^\]]+)\]\([^)]*\)");
re!(BARE_URL, r"https?://\S+");
re!(NUMERIC_CITATION, r"\[\d+(?:[,\s]*\d+)*\]");
re!(
    WORD_CITATION,
    r"(?i)\[(?:source|sources|citation|citations|ref\w*|quelle|quellen)[^\]]*\]"
);
re!(FOOTNOTE, r"(?i)\[\^(?:\d+|source|ref\w*)\]");
re!(
    PAREN_SOURCE,
    r"(?i)\((?:source|sources|citation|citations|reference|references|quelle|quellen)\s*:[^)]*\)"
);
re!(SUPERSCRIPT, "[\u{B9}\u{B2}\u{B3}\u{2070}\u{2074}-\u{2079}]+");
re!(EMPHASIS, r"\*{1,3}([^*]+)\*{1,3}");
re!(HEADER, r"(?m)^#{1,6}\s+");
re!(BULLET, r"(?m)^\s*[-*\u{2022}]\s+");
re!(
    SOURCE_HEADER_LINE,
    r"(?i)^(?:sources?|references?|citations?|quellen?)\s*:?\s*$"
);
re!(BARE_LIST_MARKER_LINE, r"^(?:\[\d+\]|\d+[.)])\s*$");
re!(
    NUMBERED_URL_LINE,
    r"(?i)^(?:\[\d+\]|\d+[.)])\s*(?:https?://\S+|www\.\S+)\s*$"
);
re!(URL_ONLY_LINE, r"(?i)^(?:https?://\S+|www\.\S+)\s*$");
re!(TRAILING_WS, r"[ \t]+\n");
re!(MULTI_NEWLINE, r"\n{2,}");
re!(MULTI_SPACE, "  +");
re!(SPACE_BEFORE_PUNCT, r"\s+([,.;:!?])");
re!(REPEATED_PUNCT, r"([,.;:!?]){2,}");

/// Strip citations, URLs, markdown, and other non-speakable artifacts.
pub fn clean_for_tts(text: &str) -> String {
    let mut text = PRIVATE_USE_SPAN.replace_all(text, "").into_owned();
    text = CJK_BRACKETS.replace_all(&text, "").into_owned();
    text = MD_LINK.replace_all(&text, "$1").into_owned();
    text = BARE_URL.replace_all(&text, "").into_owned();
    text = NUMERIC_CITATION.replace_all(&text, "").into_owned();
    text = WORD_CITATION.replace_all(&text, "").into_owned();
    text = FOOTNOTE.replace_all(&text, "").into_owned();
    text = PAREN_SOURCE.replace_all(&text, "").into_owned();
    text = SUPERSCRIPT.replace_all(&text, "").into_owned();
    text = EMPHASIS.replace_all(&text, "$1").into_owned();
    text = HEADER.replace_all(&text, "").into_owned();
    text = BULLET.replace_all(&text, "").into_owned();

    let kept: Vec<&str> = text
        .lines()
        .filter(|line| {
            let stripped = line.trim();
            if stripped.is_empty() {
                return true;
            }
            !(SOURCE_HEADER_LINE.is_match(stripped)
                || BARE_LIST_MARKER_LINE.is_match(stripped)
                || NUMBERED_URL_LINE.is_match(stripped)
                || URL_ONLY_LINE.is_match(stripped))
        })
        .collect();
    text = kept.join("\n");

    text = TRAILING_WS.replace_all(&text, "\n").into_owned();
    text = MULTI_NEWLINE.replace_all(&text, ". ").into_owned();
    text = text.replace('\n', " ");
    text = MULTI_SPACE.replace_all(&text, " ").into_owned();
    text = SPACE_BEFORE_PUNCT.replace_all(&text, "$1").into_owned();
    text = REPEATED_PUNCT.replace_all(&text, "$1").into_owned();
    text.trim().to_string()
}
