//! Whitespace cleanup passes for extracted text.
//!
//! Each pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full cleanup pipeline on raw extracted text.
pub(crate) fn run_pipeline(text: &str) -> String {
    let mut result = text.replace('\u{a0}', " ");

    result = collapse_inline_whitespace(&result);
    result = trim_lines(&result);
    result = clean_blank_lines(&result);

    result.trim().to_string()
}

// ---------------------------------------------------------------------------
// Pass 1: Collapse runs of spaces and tabs
// ---------------------------------------------------------------------------

fn collapse_inline_whitespace(text: &str) -> String {
    static INLINE_WS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t\r\f\v]+").expect("valid regex"));

    INLINE_WS_RE.replace_all(text, " ").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Trim every line
// ---------------------------------------------------------------------------

fn trim_lines(text: &str) -> String {
    text.lines().map(str::trim).collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------------
// Pass 3: Collapse blank-line runs into one paragraph break
// ---------------------------------------------------------------------------

fn clean_blank_lines(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE.replace_all(text, "\n\n").to_string()
}
