//! Extractive summarizer with a deterministic fallback.
//!
//! Contract: bounded output, idempotent on short input, no I/O. A learned
//! summarizer may replace this module but must preserve those three
//! properties; the core never calls a network service.

/// Upper bound on summary length, in chars.
pub const TARGET_CHARS: usize = 900;

/// Inputs shorter than this are not auto-summarized.
pub const MIN_AUTO_INPUT_CHARS: usize = 1000;

/// Produce a summary of redacted plaintext.
///
/// Returns `None` when the input is short and summarization was not
/// explicitly requested. Otherwise accumulates leading sentences while the
/// running total stays within [`TARGET_CHARS`]; with no usable sentence
/// boundary the text is hard-truncated on a char boundary with a trailing
/// ellipsis.
pub fn summarize(text: &str, force: bool) -> Option<String> {
    let char_count = text.chars().count();
    if !force && char_count < MIN_AUTO_INPUT_CHARS {
        return None;
    }
    if char_count <= TARGET_CHARS {
        return Some(text.trim().to_string());
    }

    let mut acc = String::new();
    let mut acc_chars = 0usize;
    for sentence in split_sentences(text) {
        let sentence_chars = sentence.chars().count();
        if acc_chars + sentence_chars > TARGET_CHARS {
            break;
        }
        acc.push_str(sentence);
        acc_chars += sentence_chars;
    }

    let acc = acc.trim();
    if !acc.is_empty() {
        return Some(acc.to_string());
    }

    // No boundary fits inside the target: truncate with an ellipsis.
    let mut out: String = text.chars().take(TARGET_CHARS - 1).collect();
    out.push('…');
    Some(out)
}

/// Split on sentence boundaries: `.`, `!`, `?` followed by whitespace (or
/// end of input). The terminator and trailing whitespace stay attached to
/// the sentence so re-joining reproduces the prefix verbatim.
fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if (b == b'.' || b == b'!' || b == b'?')
            && bytes.get(i + 1).map_or(true, |n| n.is_ascii_whitespace())
        {
            // Consume the run of whitespace after the terminator.
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            out.push(&text[start..end]);
            start = end;
            i = end;
        } else {
            i += 1;
        }
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_without_flag_returns_none() {
        assert_eq!(summarize("a short note.", false), None);
    }

    #[test]
    fn short_input_with_flag_returns_itself() {
        assert_eq!(summarize("a short note.", true), Some("a short note.".into()));
    }

    #[test]
    fn idempotent_on_short_input() {
        let first = summarize("one sentence. another one.", true).unwrap();
        let second = summarize(&first, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn long_input_accumulates_leading_sentences() {
        let sentence = "This is a reasonably sized sentence for the test. ";
        let text = sentence.repeat(40); // ~2000 chars
        let summary = summarize(&text, false).unwrap();
        assert!(summary.chars().count() <= TARGET_CHARS);
        assert!(summary.starts_with("This is a reasonably sized sentence"));
        // Whole sentences only: ends on a terminator.
        assert!(summary.ends_with('.'));
    }

    #[test]
    fn no_boundary_falls_back_to_truncation_with_ellipsis() {
        let text = "x".repeat(2000);
        let summary = summarize(&text, false).unwrap();
        assert_eq!(summary.chars().count(), TARGET_CHARS);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn oversized_first_sentence_also_truncates() {
        let mut text = "y".repeat(1500);
        text.push_str(". trailing sentence here.");
        let summary = summarize(&text, false).unwrap();
        assert!(summary.chars().count() <= TARGET_CHARS);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn output_is_always_bounded() {
        for len in [0usize, 10, 999, 1000, 1001, 5000] {
            let text = "word word word. ".repeat(len / 16 + 1);
            if let Some(s) = summarize(&text, true) {
                assert!(s.chars().count() <= TARGET_CHARS, "len {} overflowed", len);
            }
        }
    }

    #[test]
    fn multibyte_input_truncates_on_char_boundary() {
        let text = "émoji → ø ".repeat(300);
        let summary = summarize(&text, false).unwrap();
        assert!(summary.chars().count() <= TARGET_CHARS);
    }

    #[test]
    fn deterministic() {
        let text = "Sentence one. Sentence two! Sentence three? ".repeat(60);
        assert_eq!(summarize(&text, false), summarize(&text, false));
    }
}
