//! Small text helpers shared by the canon, context and quality modules.

/// Check if `text` contains `word` at word boundaries, ignoring ASCII case.
///
/// A word boundary is the start/end of string or a non-alphanumeric character,
/// so multi-word names match as a phrase and "Ren" does not match "Renna".
pub fn contains_word(text: &str, word: &str) -> bool {
    let word = word.trim();
    if word.is_empty() {
        return false;
    }

    let text_bytes = text.as_bytes();
    let word_bytes = word.as_bytes();
    let text_len = text_bytes.len();
    let word_len = word_bytes.len();

    if word_len > text_len {
        return false;
    }

    let mut i = 0;
    while i + word_len <= text_len {
        if text_bytes[i..i + word_len].eq_ignore_ascii_case(word_bytes) {
            let left_ok = i == 0 || !text_bytes[i - 1].is_ascii_alphanumeric();
            let right_ok =
                i + word_len == text_len || !text_bytes[i + word_len].is_ascii_alphanumeric();

            if left_ok && right_ok {
                return true;
            }
        }
        i += 1;
    }

    false
}

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Lowercase, collapse whitespace. Used for fuzzy equality of short strings.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split prose into sentences on terminal punctuation.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// First non-empty sentence of the text.
pub fn first_sentence(text: &str) -> Option<&str> {
    sentences(text).into_iter().next()
}

/// Last non-empty sentence of the text.
pub fn last_sentence(text: &str) -> Option<&str> {
    sentences(text).into_iter().last()
}

/// Truncate to at most `max_chars` characters, on a char boundary, appending
/// an ellipsis when anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// Jaccard similarity of the lowercase word sets of two strings.
pub fn word_overlap(a: &str, b: &str) -> f32 {
    use std::collections::HashSet;

    let words = |s: &str| -> HashSet<String> {
        s.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    };
    let a = words(a);
    let b = words(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count() as f32;
    let total = a.union(&b).count() as f32;
    shared / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_word_boundaries() {
        assert!(contains_word("ren drew his blade", "Ren"));
        assert!(!contains_word("renna drew her blade", "ren"));
        assert!(contains_word("the old tom inn", "Old Tom"));
        assert!(contains_word("Kael.", "kael"));
        assert!(!contains_word("anything", ""));
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_sentences() {
        let text = "She ran. Did he follow? Never!  And then";
        assert_eq!(sentences(text), vec!["She ran.", "Did he follow?", "Never!", "And then"]);
        assert_eq!(first_sentence(text), Some("She ran."));
        assert_eq!(last_sentence(text), Some("And then"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdefghij", 6), "abc...");
    }

    #[test]
    fn test_word_overlap() {
        assert_eq!(word_overlap("The Iron Gate", "the iron gate"), 1.0);
        assert_eq!(word_overlap("", "x"), 0.0);
        assert!(word_overlap("The Iron Gate", "The Silver Gate") > 0.3);
    }
}
