use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Truncates `s` to `max_chars` characters, appending an ellipsis when cut.
pub fn snippet(s: &str, max_chars: usize) -> Cow<'_, str> {
    if s.chars().count() <= max_chars {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("{}...", prefix_chars(s, max_chars)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_respects_char_boundaries() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(prefix_chars("ab", 10), "ab");
    }

    #[test]
    fn snippet_appends_ellipsis_only_when_cut() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("a longer string", 5), "a lon...");
    }
}
