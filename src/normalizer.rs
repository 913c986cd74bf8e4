//! Text cleanup before speech.
//!
//! Code is unpleasant to hear read aloud, so fenced blocks and inline code
//! spans are removed before anything else touches the text.

use std::sync::LazyLock;

use regex::Regex;

/// Longest text (in characters) handed to the speech backend.
pub const MAX_SPEAKABLE_CHARS: usize = 1000;

static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid code fence pattern"));
static INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`]*`").expect("valid inline code pattern"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));
static DISALLOWED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^A-Za-z0-9_\s.,!?;:()\-]").expect("valid character filter pattern")
});

/// Turn raw suggestion text into something a speech engine can read.
///
/// Stages run in a fixed order: fenced blocks, inline code, whitespace
/// collapse and trim, then the character filter. Whitespace is collapsed
/// before symbols are dropped, so `"a @# b"` keeps two spaces.
pub fn normalize(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }

    let text = CODE_FENCE.replace_all(raw, "");
    let text = INLINE_CODE.replace_all(&text, "");
    let text = WHITESPACE_RUN.replace_all(&text, " ");
    DISALLOWED.replace_all(text.trim(), "").into_owned()
}

/// Whether `text` is worth sending to the speech backend.
pub fn is_speakable(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if text.chars().count() > MAX_SPEAKABLE_CHARS {
        return false;
    }
    trimmed.split_whitespace().any(|token| !token.is_empty())
}
