//! Result Snippets
//!
//! ≤280-character excerpt per hit, centered on the first query-term
//! occurrence across title, description, then body; leading text when no
//! term matches. Slicing respects character boundaries.

/// Maximum snippet length in bytes.
pub const MAX_SNIPPET_LEN: usize = 280;

/// Build a snippet for a hit. `terms` are lowercased query tokens.
pub fn make_snippet(title: &str, description: &str, body: &str, terms: &[String]) -> String {
    for source in [title, description, body] {
        if source.is_empty() {
            continue;
        }
        if let Some(pos) = first_occurrence(source, terms) {
            return window_around(source, pos);
        }
    }

    // No term matched anywhere: lead with whichever field has text
    for source in [description, body, title] {
        if !source.is_empty() {
            return window_around(source, 0);
        }
    }
    String::new()
}

/// Byte position of the first occurrence of any term, case-insensitive.
fn first_occurrence(text: &str, terms: &[String]) -> Option<usize> {
    let lowered = text.to_lowercase();
    terms
        .iter()
        .filter(|t| !t.is_empty())
        .filter_map(|t| lowered.find(t.as_str()))
        .min()
}

/// A ≤280-byte window centered on `pos`, snapped to character boundaries,
/// with ellipses marking truncation.
fn window_around(text: &str, pos: usize) -> String {
    if text.len() <= MAX_SNIPPET_LEN {
        return text.to_string();
    }

    let half = MAX_SNIPPET_LEN / 2;
    let mut start = pos.saturating_sub(half);
    let mut end = (start + MAX_SNIPPET_LEN).min(text.len());
    if end - start < MAX_SNIPPET_LEN {
        start = end.saturating_sub(MAX_SNIPPET_LEN);
    }

    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let mut snippet = String::with_capacity(end - start + 2);
    if start > 0 {
        snippet.push('…');
    }
    snippet.push_str(text[start..end].trim());
    if end < text.len() {
        snippet.push('…');
    }

    // Ellipses may push past the cap; trim from the front on char boundaries
    while snippet.len() > MAX_SNIPPET_LEN + '…'.len_utf8() * 2 {
        let mut cut = 1;
        while !snippet.is_char_boundary(cut) {
            cut += 1;
        }
        snippet.replace_range(..cut, "");
    }
    snippet
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_lowercase()).collect()
    }

    #[test]
    fn test_short_text_returned_whole() {
        let snippet = make_snippet("Rust in Action", "", "", &terms(&["rust"]));
        assert_eq!(snippet, "Rust in Action");
    }

    #[test]
    fn test_centered_on_first_occurrence_in_body() {
        let body = format!("{}quixotic{}", "x".repeat(500), "y".repeat(500));
        let snippet = make_snippet("unrelated title", "", &body, &terms(&["quixotic"]));
        assert!(snippet.contains("quixotic"));
        assert!(snippet.len() <= MAX_SNIPPET_LEN + 8);
    }

    #[test]
    fn test_falls_back_to_leading_text() {
        let body = "z".repeat(600);
        let snippet = make_snippet("", "", &body, &terms(&["missing"]));
        assert!(snippet.starts_with('z'));
        assert!(snippet.len() <= MAX_SNIPPET_LEN + 8);
    }

    #[test]
    fn test_title_preferred_over_body() {
        let snippet = make_snippet(
            "rust appears here",
            "",
            "rust also appears much later in the body",
            &terms(&["rust"]),
        );
        assert_eq!(snippet, "rust appears here");
    }

    #[test]
    fn test_multibyte_boundaries_respected() {
        let body = format!("{}término{}", "é".repeat(300), "ü".repeat(300));
        let snippet = make_snippet("", "", &body, &terms(&["término"]));
        assert!(snippet.contains("término"));
    }
}
