//! File actions: read, write, edit, patch, list and search.
//!
//! Every mutating action validates first, then snapshots the existing file through
//! the version store, then writes. Failures come back as `Error:` / `VIOLATION:`
//! strings; only unexpected I/O problems surface as `Err`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use super::{lenient, ToolContext};
use crate::guards::placeholder_violation;

/// Maximum number of hits `search_files` reports.
const MAX_SEARCH_RESULTS: usize = 30;

/// Directories `search_files` never descends into (besides the backup directory).
const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", "node_modules", "target", "__pycache__"];

const PATCH_OPERATIONS: &str =
    "insert_at_line, replace_lines, append, prepend, add_after, add_before, delete_lines";

/// Resolve a model-supplied path against the workspace. `~/` expands to home.
pub fn resolve_path(raw: &str, workspace: &Path) -> PathBuf {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

// ============================================================================
// Arguments
// ============================================================================

fn first_line() -> i64 {
    1
}

fn to_end() -> i64 {
    -1
}

fn current_dir() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadArgs {
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default = "first_line", deserialize_with = "lenient::int")]
    pub start_line: i64,
    /// `-1` reads to the end.
    #[serde(default = "to_end", deserialize_with = "lenient::int")]
    pub end_line: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WriteArgs {
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditArgs {
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default, alias = "old_content")]
    pub target: String,
    #[serde(default, alias = "new_content")]
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PatchArgs {
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(flatten)]
    pub op: PatchOp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PatchOp {
    InsertAtLine {
        #[serde(default = "first_line", deserialize_with = "lenient::int")]
        line: i64,
        #[serde(default)]
        content: String,
    },
    ReplaceLines {
        #[serde(default = "first_line", deserialize_with = "lenient::int")]
        start_line: i64,
        #[serde(default, deserialize_with = "lenient::opt_int")]
        end_line: Option<i64>,
        #[serde(default)]
        content: String,
    },
    Append {
        #[serde(default)]
        content: String,
    },
    Prepend {
        #[serde(default)]
        content: String,
    },
    AddAfter {
        #[serde(default)]
        marker: String,
        #[serde(default)]
        content: String,
    },
    AddBefore {
        #[serde(default)]
        marker: String,
        #[serde(default)]
        content: String,
    },
    DeleteLines {
        #[serde(default = "first_line", deserialize_with = "lenient::int")]
        start_line: i64,
        #[serde(default, deserialize_with = "lenient::opt_int")]
        end_line: Option<i64>,
    },
}

impl PatchOp {
    pub const NAMES: [&'static str; 7] = [
        "insert_at_line",
        "replace_lines",
        "append",
        "prepend",
        "add_after",
        "add_before",
        "delete_lines",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::InsertAtLine { .. } => "insert_at_line",
            PatchOp::ReplaceLines { .. } => "replace_lines",
            PatchOp::Append { .. } => "append",
            PatchOp::Prepend { .. } => "prepend",
            PatchOp::AddAfter { .. } => "add_after",
            PatchOp::AddBefore { .. } => "add_before",
            PatchOp::DeleteLines { .. } => "delete_lines",
        }
    }

    fn content(&self) -> Option<&str> {
        match self {
            PatchOp::InsertAtLine { content, .. }
            | PatchOp::ReplaceLines { content, .. }
            | PatchOp::Append { content }
            | PatchOp::Prepend { content }
            | PatchOp::AddAfter { content, .. }
            | PatchOp::AddBefore { content, .. } => Some(content),
            PatchOp::DeleteLines { .. } => None,
        }
    }
}

/// Message for a `patch_file` call whose `operation` is missing or unknown.
pub fn patch_operation_error(operation: Option<&str>) -> String {
    match operation {
        None => format!(
            "'operation' argument is required. Valid operations: {}.",
            PATCH_OPERATIONS
        ),
        Some(op) => format!("Unknown operation '{}'. Use: {}", op, PATCH_OPERATIONS),
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListArgs {
    #[serde(default = "current_dir", alias = "dir_path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchArgs {
    #[serde(default = "current_dir", alias = "dir_path")]
    pub path: String,
    #[serde(alias = "search_term", alias = "query")]
    pub term: String,
}

// ============================================================================
// Actions
// ============================================================================

pub async fn read_file(args: &ReadArgs, ctx: &ToolContext) -> Result<String> {
    let path = ctx.resolve(&args.path);
    if path.is_dir() {
        return Ok(format!(
            "Error: {} is a directory. Use list_dir instead.",
            args.path
        ));
    }
    if !path.exists() {
        return Ok(format!("Error: File {} not found.", args.path));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    let start = args.start_line.max(1) as usize;
    let end = if args.end_line < 0 || args.end_line as usize > lines.len() {
        lines.len()
    } else {
        args.end_line as usize
    };
    if start > end {
        return Ok(String::new());
    }
    Ok(lines[start - 1..end].concat())
}

pub async fn write_file(args: &WriteArgs, ctx: &ToolContext) -> Result<String> {
    if args.content.is_empty() {
        return Ok("Error: Content cannot be empty.".to_string());
    }
    if let Some(violation) = placeholder_violation(&args.content) {
        return Ok(violation);
    }

    let path = ctx.resolve(&args.path);
    if path.is_dir() {
        return Ok(format!("Error: {} is a directory.", args.path));
    }
    let existed = path.is_file();
    if existed {
        ctx.versions.backup(&path, "modify")?;
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&path, &args.content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    let action = if existed { "updated" } else { "created" };
    Ok(format!("Successfully {} {}", action, args.path))
}

pub async fn edit_file(args: &EditArgs, ctx: &ToolContext) -> Result<String> {
    if args.target.trim().is_empty() {
        return Ok("Error: `target` cannot be empty.".to_string());
    }
    let path = ctx.resolve(&args.path);
    if !path.is_file() {
        return Ok(format!(
            "Error: File {} does not exist. Use `write_file` for new files.",
            args.path
        ));
    }

    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    match content.matches(args.target.as_str()).count() {
        0 => return Ok(format!("Error: Target text not found in {}", args.path)),
        1 => {}
        n => return Ok(format!("Error: Target found {} times. Must be unique.", n)),
    }

    ctx.versions.backup(&path, "edit")?;
    let updated = content.replacen(args.target.as_str(), &args.replacement, 1);
    tokio::fs::write(&path, updated)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(format!("Successfully edited {}", args.path))
}

pub async fn patch_file(args: &PatchArgs, ctx: &ToolContext) -> Result<String> {
    let path = ctx.resolve(&args.path);
    if !path.is_file() {
        return Ok(format!("Error: File {} not found.", args.path));
    }
    if let Some(violation) = args.op.content().and_then(placeholder_violation) {
        return Ok(violation);
    }

    let original = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut lines: Vec<String> = original.split_inclusive('\n').map(str::to_string).collect();
    let original_len = lines.len();

    let summary = match apply_patch(&mut lines, &args.op) {
        Ok(summary) => summary,
        Err(message) => return Ok(format!("Error: {}", message)),
    };

    ctx.versions.backup(&path, "patch")?;
    tokio::fs::write(&path, lines.concat())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(format!(
        "Success: {} (was {} lines, now {} lines)",
        summary,
        original_len,
        lines.len()
    ))
}

/// Apply one patch operation to newline-inclusive lines. Line numbers are 1-based
/// and clamped to the file.
fn apply_patch(lines: &mut Vec<String>, op: &PatchOp) -> std::result::Result<String, String> {
    let len = lines.len() as i64;
    match op {
        PatchOp::InsertAtLine { line, content } => {
            let at = (*line).clamp(1, len + 1);
            if at == len + 1 {
                terminate_last(lines);
            }
            lines.insert((at - 1) as usize, with_newline(content));
            Ok(format!("Inserted at line {}", at))
        }
        PatchOp::ReplaceLines {
            start_line,
            end_line,
            content,
        } => {
            let (start, end) = clamp_range(*start_line, *end_line, len)?;
            if end == len {
                terminate_last(lines);
            }
            lines.splice((start - 1) as usize..end as usize, [with_newline(content)]);
            Ok(format!("Replaced lines {}-{}", start, end))
        }
        PatchOp::Append { content } => {
            terminate_last(lines);
            lines.push(with_newline(content));
            Ok("Appended to file".to_string())
        }
        PatchOp::Prepend { content } => {
            lines.insert(0, with_newline(content));
            Ok("Prepended to file".to_string())
        }
        PatchOp::AddAfter { marker, content } => {
            let i = find_marker(lines, marker, "add_after")?;
            if i + 1 == lines.len() {
                terminate_last(lines);
            }
            lines.insert(i + 1, with_newline(content));
            Ok(format!("Added after line {}", i + 1))
        }
        PatchOp::AddBefore { marker, content } => {
            let i = find_marker(lines, marker, "add_before")?;
            lines.insert(i, with_newline(content));
            Ok(format!("Added before line {}", i + 1))
        }
        PatchOp::DeleteLines {
            start_line,
            end_line,
        } => {
            let (start, end) = clamp_range(*start_line, *end_line, len)?;
            lines.drain((start - 1) as usize..end as usize);
            Ok(format!("Deleted lines {}-{}", start, end))
        }
    }
}

/// Inclusive 1-based range clamped to the file. A negative `end` means the last
/// line; a missing one means `start`.
fn clamp_range(start: i64, end: Option<i64>, len: i64) -> std::result::Result<(i64, i64), String> {
    if len == 0 {
        return Err("File is empty; use append or prepend".to_string());
    }
    let start = start.clamp(1, len);
    let end = match end {
        Some(end) if end < 0 => len,
        Some(end) => end.min(len),
        None => start,
    };
    if end < start {
        return Err(format!(
            "end_line {} is before start_line {}",
            end, start
        ));
    }
    Ok((start, end))
}

fn find_marker(lines: &[String], marker: &str, op: &str) -> std::result::Result<usize, String> {
    if marker.is_empty() {
        return Err(format!("'marker' is required for {}", op));
    }
    lines.iter().position(|l| l.contains(marker)).ok_or_else(|| {
        let short: String = marker.chars().take(30).collect();
        format!("Marker '{}...' not found in file", short)
    })
}

fn with_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{}\n", content)
    }
}

fn terminate_last(lines: &mut [String]) {
    if let Some(last) = lines.last_mut() {
        if !last.ends_with('\n') {
            last.push('\n');
        }
    }
}

pub async fn list_dir(args: &ListArgs, ctx: &ToolContext) -> Result<String> {
    let path = ctx.resolve(&args.path);
    if !path.is_dir() {
        return Ok(format!("Error: Directory {} not found.", args.path));
    }

    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(&path)
        .await
        .with_context(|| format!("Failed to list {}", path.display()))?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push((name, is_dir));
    }
    entries.sort();

    if entries.is_empty() {
        return Ok("(empty directory)".to_string());
    }
    Ok(entries
        .into_iter()
        .map(|(name, is_dir)| {
            let tag = if is_dir { "[DIR]" } else { "[FILE]" };
            format!("{} {}", tag, name)
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

pub async fn search_files(args: &SearchArgs, ctx: &ToolContext) -> Result<String> {
    if args.term.is_empty() {
        return Ok("Error: search term cannot be empty.".to_string());
    }
    let root = ctx.resolve(&args.path);
    if !root.is_dir() {
        return Ok(format!("Error: Directory {} not found.", args.path));
    }

    let term = args.term.clone();
    let workspace = ctx.workspace.clone();
    let backup_dir = ctx.backup_dir_name.clone();
    tokio::task::spawn_blocking(move || search_tree(&root, &workspace, &term, &backup_dir))
        .await
        .context("search task panicked")
}

fn search_tree(root: &Path, workspace: &Path, term: &str, backup_dir: &str) -> String {
    let walker = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir()
                && e.depth() > 0
                && (SKIPPED_DIRS.contains(&name.as_ref()) || name == backup_dir))
        });

    let mut results = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if bytes.contains(&0) {
            continue;
        }
        let text = String::from_utf8_lossy(&bytes);
        let shown = entry.path().strip_prefix(workspace).unwrap_or(entry.path());
        for (i, line) in text.lines().enumerate() {
            if !line.contains(term) {
                continue;
            }
            let snippet: String = line.trim().chars().take(80).collect();
            results.push(format!("{}:{}: {}", shown.display(), i + 1, snippet));
            if results.len() >= MAX_SEARCH_RESULTS {
                return format!("{}\n... (limit reached)", results.join("\n"));
            }
        }
    }

    if results.is_empty() {
        "No matches found.".to_string()
    } else {
        results.join("\n")
    }
}
