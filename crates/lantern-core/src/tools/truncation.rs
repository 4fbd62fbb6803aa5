//! Output truncation for shell command results
//!
//! Dual-limit tail truncation (lines + bytes).

/// Result of a truncation operation
pub struct TruncationResult {
    pub text: String,
    pub was_truncated: bool,
    pub lines_shown: usize,
    pub lines_total: usize,
}

impl TruncationResult {
    /// Format a truncation notice for appending to output
    pub fn notice(&self) -> Option<String> {
        if !self.was_truncated {
            return None;
        }
        Some(format!(
            "\n[Output truncated: showed last {} of {} lines]",
            self.lines_shown, self.lines_total,
        ))
    }
}

/// Tail-truncate: keep the last N lines/bytes.
pub fn truncate_tail(text: &str, max_lines: usize, max_bytes: usize) -> TruncationResult {
    let lines: Vec<&str> = text.lines().collect();
    let lines_total = lines.len();

    if lines_total <= max_lines && text.len() <= max_bytes {
        return TruncationResult {
            text: text.to_string(),
            was_truncated: false,
            lines_shown: lines_total,
            lines_total,
        };
    }

    let line_limited = if lines_total > max_lines {
        &lines[lines_total - max_lines..]
    } else {
        &lines[..]
    };

    let joined = line_limited.join("\n");
    let (text, lines_shown) = if joined.len() > max_bytes {
        let mut skip = joined.len() - max_bytes;
        while !joined.is_char_boundary(skip) {
            skip += 1;
        }
        // Align to the next line boundary
        let start = joined[skip..]
            .find('\n')
            .map(|pos| skip + pos + 1)
            .unwrap_or(skip);
        let trimmed = &joined[start..];
        (trimmed.to_string(), trimmed.lines().count())
    } else {
        let shown = line_limited.len();
        (joined, shown)
    };

    TruncationResult {
        text,
        was_truncated: true,
        lines_shown,
        lines_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        let result = truncate_tail("a\nb", 10, 100);
        assert!(!result.was_truncated);
        assert_eq!(result.text, "a\nb");
        assert!(result.notice().is_none());
    }

    #[test]
    fn keeps_last_lines() {
        let text = (1..=10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let result = truncate_tail(&text, 3, 1000);
        assert!(result.was_truncated);
        assert_eq!(result.text, "8\n9\n10");
        assert_eq!(result.lines_total, 10);
        assert!(result.notice().unwrap().contains("3 of 10"));
    }

    #[test]
    fn byte_limit_aligns_to_line_boundary() {
        let text = "aaaa\nbbbb\ncccc";
        let result = truncate_tail(text, 100, 7);
        assert!(result.was_truncated);
        assert_eq!(result.text, "cccc");
    }
}
