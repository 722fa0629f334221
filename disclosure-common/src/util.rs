//! Text utilities shared by the pipeline stages.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Uses character boundaries, so multi-byte UTF-8 input is never split.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Return the prefix of `s` holding at most `max_chars` characters.
///
/// The second element is `true` when anything was cut off.
pub fn char_prefix(s: &str, max_chars: usize) -> (&str, bool) {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => (&s[..idx], true),
        None => (s, false),
    }
}

/// Number of characters (not bytes) in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Collapse runs of whitespace into single spaces and lowercase the result.
///
/// Used wherever two snippets are compared for textual identity.
pub fn normalize_for_match(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(truncate_with_ellipsis("€€€€", 2), "€€...");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn test_char_prefix() {
        assert_eq!(char_prefix("abcdef", 3), ("abc", true));
        assert_eq!(char_prefix("abc", 3), ("abc", false));
        assert_eq!(char_prefix("ééé", 1), ("é", true));
    }

    #[test]
    fn test_char_len_counts_chars() {
        assert_eq!(char_len("ééé"), 3);
        assert_eq!(char_len(""), 0);
    }

    #[test]
    fn test_normalize_for_match() {
        assert_eq!(normalize_for_match("  Net   Interest\nMargin "), "net interest margin");
    }
}
