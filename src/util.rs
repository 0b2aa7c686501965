//! Small string helpers shared by the composer and the Discord transport.

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Cuts on character boundaries, so multi-byte UTF-8 (emoji, CJK) never panics.
///
/// ```ignore
/// use duocast::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            // Trim trailing whitespace for cleaner output
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_titles_are_left_alone() {
        assert_eq!(truncate_with_ellipsis("Ranked grind", 50), "Ranked grind");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn exact_boundary_is_not_truncated() {
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
    }

    #[test]
    fn long_titles_are_cut_and_trimmed() {
        assert_eq!(
            truncate_with_ellipsis("Speedrun any% attempts", 9),
            "Speedrun..."
        );
    }

    #[test]
    fn multibyte_characters_cut_on_boundaries() {
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("café résumé naïve", 10), "café résum...");
        let cjk = "这是一个测试消息用来触发崩溃的中文";
        let result = truncate_with_ellipsis(cjk, 16);
        assert!(result.ends_with("..."));
    }
}
