//! Unified diff rendering shared by the version store and write previews.

use similar::{ChangeTag, TextDiff};

/// Unified diff with file headers and three lines of context. Empty when the inputs are equal.
pub fn unified_diff(original: &str, modified: &str, from: &str, to: &str) -> String {
    if original == modified {
        return String::new();
    }
    let diff = TextDiff::from_lines(original, modified);
    diff.unified_diff()
        .context_radius(3)
        .header(from, to)
        .to_string()
}

/// Count of inserted and deleted lines, used for compact previews.
pub fn change_counts(original: &str, modified: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(original, modified);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    (added, removed)
}
