//! Operator-curated files that are rendered into every prompt.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Set of absolute paths. Rendering reads each file fresh, so edits show up on the next prompt.
#[derive(Debug, Clone)]
pub struct FocusSet {
    files: BTreeSet<PathBuf>,
    line_limit: usize,
}

impl FocusSet {
    pub fn new(line_limit: usize) -> Self {
        Self {
            files: BTreeSet::new(),
            line_limit,
        }
    }

    /// Add a file. Adding a file that is already focused is a no-op success.
    pub fn add(&mut self, path: &Path) -> String {
        if !path.is_file() {
            return format!("Error: File {} does not exist.", path.display());
        }
        if self.files.insert(path.to_path_buf()) {
            tracing::debug!("Focused {}", path.display());
            format!("Added {} to focus.", path.display())
        } else {
            format!("{} is already in focus.", path.display())
        }
    }

    pub fn remove(&mut self, path: &Path) -> String {
        if self.files.remove(path) {
            tracing::debug!("Unfocused {}", path.display());
            format!("Removed {} from focus.", path.display())
        } else {
            format!("File {} was not in focus.", path.display())
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    /// Prompt block with the first `line_limit` lines of every focused file, or `None` when empty.
    pub fn render(&self) -> Option<String> {
        if self.files.is_empty() {
            return None;
        }

        let mut out = String::from("\n=== ACTIVE CONTEXT (FOCUSED FILES) ===\n");
        for path in &self.files {
            out.push_str(&format!("\nFile: {}\n", path.display()));
            out.push_str("--------------------------------------\n");
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let total = content.lines().count();
                    for line in content.lines().take(self.line_limit) {
                        out.push_str(line);
                        out.push('\n');
                    }
                    if total > self.line_limit {
                        out.push_str(&format!(
                            "... (truncated after {} lines) ...\n",
                            self.line_limit
                        ));
                    }
                }
                Err(e) => out.push_str(&format!("[Error reading file: {}]\n", e)),
            }
            out.push_str("--------------------------------------\n");
        }
        out.push_str("======================================\n");
        Some(out)
    }
}

impl Default for FocusSet {
    fn default() -> Self {
        Self::new(200)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        std::fs::write(&file, "hello\n").unwrap();

        let mut focus = FocusSet::default();
        assert!(focus.add(&file).starts_with("Added"));
        assert!(focus.add(&file).contains("already"));
        assert_eq!(focus.len(), 1);

        assert!(focus.remove(&file).starts_with("Removed"));
        assert!(focus.remove(&file).contains("was not in focus"));
        assert!(focus.is_empty());
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut focus = FocusSet::default();
        let result = focus.add(&dir.path().join("nope.rs"));
        assert!(result.starts_with("Error:"));
        assert!(focus.is_empty());
    }

    #[test]
    fn render_truncates_long_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("long.txt");
        let body: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(&file, body).unwrap();

        let mut focus = FocusSet::new(3);
        focus.add(&file);
        let rendered = focus.render().unwrap();

        assert!(rendered.contains("line 3"));
        assert!(!rendered.contains("line 4"));
        assert!(rendered.contains("truncated after 3 lines"));
    }

    #[test]
    fn render_is_none_when_empty() {
        assert!(FocusSet::default().render().is_none());
    }
}
