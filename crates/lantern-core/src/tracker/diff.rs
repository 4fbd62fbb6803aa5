//! Bounded line diffs between a snapshot and the current file

use serde::Serialize;
use similar::{ChangeTag, TextDiff};

/// Unchanged lines kept around each change
const CONTEXT_RADIUS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffLineKind {
    Context,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub kind: DiffLineKind,
    pub text: String,
    /// 1-based line in the before side
    pub old_line: Option<usize>,
    /// 1-based line in the after side
    pub new_line: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub lines: Vec<DiffLine>,
    /// Counted over the whole diff, not just the retained records
    pub additions: usize,
    pub removals: usize,
    pub truncated: bool,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.additions == 0 && self.removals == 0
    }
}

/// Diff two byte buffers. Returns `None` when either side is not UTF-8.
pub fn compute_diff(before: &[u8], after: &[u8], max_lines: usize) -> Option<DiffSummary> {
    let before = std::str::from_utf8(before).ok()?;
    let after = std::str::from_utf8(after).ok()?;
    Some(diff_text(before, after, max_lines))
}

pub fn diff_text(before: &str, after: &str, max_lines: usize) -> DiffSummary {
    let diff = TextDiff::from_lines(before, after);
    let mut summary = DiffSummary::default();

    for group in diff.grouped_ops(CONTEXT_RADIUS) {
        for op in &group {
            for change in diff.iter_changes(op) {
                let kind = match change.tag() {
                    ChangeTag::Equal => DiffLineKind::Context,
                    ChangeTag::Insert => {
                        summary.additions += 1;
                        DiffLineKind::Add
                    }
                    ChangeTag::Delete => {
                        summary.removals += 1;
                        DiffLineKind::Remove
                    }
                };

                if summary.lines.len() >= max_lines {
                    summary.truncated = true;
                    continue;
                }

                summary.lines.push(DiffLine {
                    kind,
                    text: change.value().trim_end_matches(['\n', '\r']).to_string(),
                    old_line: change.old_index().map(|i| i + 1),
                    new_line: change.new_index().map(|i| i + 1),
                });
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_file_is_all_additions() {
        let summary = diff_text("", "one\ntwo\n", 100);
        assert_eq!(summary.additions, 2);
        assert_eq!(summary.removals, 0);
        assert!(summary.lines.iter().all(|l| l.kind == DiffLineKind::Add));
        assert_eq!(summary.lines[1].text, "two");
        assert_eq!(summary.lines[1].new_line, Some(2));
    }

    #[test]
    fn edits_keep_limited_context() {
        let before: String = (1..=20).map(|i| format!("line {}\n", i)).collect();
        let after = before.replace("line 10\n", "line ten\n");
        let summary = diff_text(&before, &after, 100);

        assert_eq!(summary.additions, 1);
        assert_eq!(summary.removals, 1);
        let context = summary
            .lines
            .iter()
            .filter(|l| l.kind == DiffLineKind::Context)
            .count();
        assert_eq!(context, 2 * CONTEXT_RADIUS);
        assert!(!summary.truncated);
    }

    #[test]
    fn caps_records_but_counts_everything() {
        let after: String = (0..50).map(|i| format!("{}\n", i)).collect();
        let summary = diff_text("", &after, 10);
        assert_eq!(summary.lines.len(), 10);
        assert_eq!(summary.additions, 50);
        assert!(summary.truncated);
    }

    #[test]
    fn identical_content_is_empty() {
        let summary = diff_text("same\n", "same\n", 10);
        assert!(summary.is_empty());
        assert!(summary.lines.is_empty());
    }

    #[test]
    fn non_utf8_has_no_diff() {
        assert!(compute_diff(&[0xff, 0xfe], b"text", 10).is_none());
    }
}
