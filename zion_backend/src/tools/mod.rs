//! Action registry: the closed set of operations the model can request.
//!
//! A [`ToolInvocation`] from the interpreter is validated into a typed [`Action`]
//! before anything runs. Unknown names and malformed arguments are distinct
//! [`ActionError`] variants. Execution never raises: every action yields a
//! [`ToolResult`] whose failure flag comes only from the `Error:` / `VIOLATION:`
//! marker at the start of its output.

pub mod approval;
pub mod context;
pub mod files;
pub mod safety;
pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentEvent;
use crate::focus::FocusSet;
use crate::versioning::VersionStore;

pub use crate::interpreter::ToolInvocation;
use context::PathArgs;
use files::{EditArgs, ListArgs, PatchArgs, ReadArgs, SearchArgs, WriteArgs};
use shell::{CommandArgs, ShellSettings};

/// Output prefixes that mark a failed action.
pub const ERROR_MARKERS: &[&str] = &["Error:", "VIOLATION:"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileSystem,
    Shell,
    Context,
}

impl ToolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::FileSystem => "file_system",
            ToolCategory::Shell => "shell",
            ToolCategory::Context => "context",
        }
    }
}

/// Every action the registry knows, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    EditFile,
    PatchFile,
    ListDir,
    SearchFiles,
    RunCommand,
    FocusFile,
    UnfocusFile,
}

impl ActionKind {
    pub const ALL: [ActionKind; 9] = [
        ActionKind::ReadFile,
        ActionKind::WriteFile,
        ActionKind::EditFile,
        ActionKind::PatchFile,
        ActionKind::ListDir,
        ActionKind::SearchFiles,
        ActionKind::RunCommand,
        ActionKind::FocusFile,
        ActionKind::UnfocusFile,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::ReadFile => "read_file",
            ActionKind::WriteFile => "write_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::PatchFile => "patch_file",
            ActionKind::ListDir => "list_dir",
            ActionKind::SearchFiles => "search_files",
            ActionKind::RunCommand => "run_command",
            ActionKind::FocusFile => "focus_file",
            ActionKind::UnfocusFile => "unfocus_file",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn category(&self) -> ToolCategory {
        match self {
            ActionKind::RunCommand => ToolCategory::Shell,
            ActionKind::FocusFile | ActionKind::UnfocusFile => ToolCategory::Context,
            _ => ToolCategory::FileSystem,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ActionKind::ReadFile => "Read a file. Optional inclusive 1-based line range; end_line -1 reads to the end.",
            ActionKind::WriteFile => "Create or overwrite a file with the full content. The previous version is backed up.",
            ActionKind::EditFile => "Replace one exact, unique occurrence of `target` with `replacement`.",
            ActionKind::PatchFile => "Targeted line edit: insert_at_line, replace_lines, append, prepend, add_after, add_before, delete_lines.",
            ActionKind::ListDir => "List a directory. Entries are tagged [FILE] or [DIR].",
            ActionKind::SearchFiles => "Search file contents under a directory for a literal term (max 30 hits).",
            ActionKind::RunCommand => "Run a shell command in the workspace with a timeout. Set interactive for commands that prompt.",
            ActionKind::FocusFile => "Pin a file so its first lines are shown in every prompt.",
            ActionKind::UnfocusFile => "Remove a file from the pinned set.",
        }
    }

    /// JSON Schema of the arguments, used in prompts and returned by the service.
    pub fn parameters_schema(&self) -> Value {
        let path = serde_json::json!({"type": "string", "description": "Path, absolute or relative to the workspace"});
        match self {
            ActionKind::ReadFile => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "start_line": {"type": "integer", "description": "First line (default 1)"},
                    "end_line": {"type": "integer", "description": "Last line, inclusive (default -1 = end)"}
                },
                "required": ["path"]
            }),
            ActionKind::WriteFile => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "content": {"type": "string", "description": "Complete file content"}
                },
                "required": ["path", "content"]
            }),
            ActionKind::EditFile => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "target": {"type": "string", "description": "Exact text to replace; must occur once"},
                    "replacement": {"type": "string", "description": "Replacement text"}
                },
                "required": ["path", "target", "replacement"]
            }),
            ActionKind::PatchFile => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "operation": {
                        "type": "string",
                        "enum": ["insert_at_line", "replace_lines", "append", "prepend", "add_after", "add_before", "delete_lines"]
                    },
                    "line": {"type": "integer", "description": "Line for insert_at_line"},
                    "start_line": {"type": "integer", "description": "First line for replace_lines/delete_lines"},
                    "end_line": {"type": "integer", "description": "Last line for replace_lines/delete_lines"},
                    "marker": {"type": "string", "description": "Text to find for add_after/add_before"},
                    "content": {"type": "string", "description": "Content to insert"}
                },
                "required": ["path", "operation"]
            }),
            ActionKind::ListDir => serde_json::json!({
                "type": "object",
                "properties": {"path": path},
                "required": ["path"]
            }),
            ActionKind::SearchFiles => serde_json::json!({
                "type": "object",
                "properties": {
                    "path": path,
                    "term": {"type": "string", "description": "Literal text to find"}
                },
                "required": ["path", "term"]
            }),
            ActionKind::RunCommand => serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command (run with /bin/sh -c)"},
                    "timeout": {"type": "integer", "description": "Seconds before the process is killed (default 120)"},
                    "interactive": {"type": "boolean", "description": "Run in a pseudo-terminal for prompting commands"}
                },
                "required": ["command"]
            }),
            ActionKind::FocusFile | ActionKind::UnfocusFile => serde_json::json!({
                "type": "object",
                "properties": {"path": path},
                "required": ["path"]
            }),
        }
    }

    /// One-line call example for the system prompt.
    pub fn example(&self) -> &'static str {
        match self {
            ActionKind::ReadFile => r#"{"tool": "read_file", "args": {"path": "src/main.rs", "start_line": 1, "end_line": 80}}"#,
            ActionKind::WriteFile => r#"{"tool": "write_file", "args": {"path": "src/util.rs", "content": "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n"}}"#,
            ActionKind::EditFile => r#"{"tool": "edit_file", "args": {"path": "src/main.rs", "target": "let x = 1;", "replacement": "let x = 2;"}}"#,
            ActionKind::PatchFile => r#"{"tool": "patch_file", "args": {"path": "src/main.rs", "operation": "insert_at_line", "line": 3, "content": "use std::fs;"}}"#,
            ActionKind::ListDir => r#"{"tool": "list_dir", "args": {"path": "."}}"#,
            ActionKind::SearchFiles => r#"{"tool": "search_files", "args": {"path": ".", "term": "fn main"}}"#,
            ActionKind::RunCommand => r#"{"tool": "run_command", "args": {"command": "cargo test", "timeout": 300}}"#,
            ActionKind::FocusFile => r#"{"tool": "focus_file", "args": {"path": "src/lib.rs"}}"#,
            ActionKind::UnfocusFile => r#"{"tool": "unfocus_file", "args": {"path": "src/lib.rs"}}"#,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("Tool '{0}' not found.")]
    UnknownTool(String),
    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

/// A validated request, one variant per action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ReadFile(ReadArgs),
    WriteFile(WriteArgs),
    EditFile(EditArgs),
    PatchFile(PatchArgs),
    ListDir(ListArgs),
    SearchFiles(SearchArgs),
    RunCommand(CommandArgs),
    FocusFile(PathArgs),
    UnfocusFile(PathArgs),
}

impl Action {
    pub fn from_invocation(invocation: &ToolInvocation) -> Result<Self, ActionError> {
        let kind = ActionKind::from_name(&invocation.tool)
            .ok_or_else(|| ActionError::UnknownTool(invocation.tool.clone()))?;
        let invalid = |reason: String| ActionError::InvalidArguments {
            tool: invocation.tool.clone(),
            reason,
        };

        if let safety::SafetyVerdict::Block(reason) = safety::validate_input(&invocation.args) {
            return Err(invalid(reason));
        }
        if kind == ActionKind::PatchFile {
            match invocation.args.get("operation").and_then(Value::as_str) {
                None => return Err(invalid(files::patch_operation_error(None))),
                Some(op) if files::PatchOp::NAMES.contains(&op) => {}
                Some(op) => return Err(invalid(files::patch_operation_error(Some(op)))),
            }
        }

        fn parse<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, String> {
            serde_json::from_value(args.clone()).map_err(|e| e.to_string())
        }
        let args = &invocation.args;
        let action = match kind {
            ActionKind::ReadFile => parse(args).map(Action::ReadFile),
            ActionKind::WriteFile => parse(args).map(Action::WriteFile),
            ActionKind::EditFile => parse(args).map(Action::EditFile),
            ActionKind::PatchFile => parse(args).map(Action::PatchFile),
            ActionKind::ListDir => parse(args).map(Action::ListDir),
            ActionKind::SearchFiles => parse(args).map(Action::SearchFiles),
            ActionKind::RunCommand => parse(args).map(Action::RunCommand),
            ActionKind::FocusFile => parse(args).map(Action::FocusFile),
            ActionKind::UnfocusFile => parse(args).map(Action::UnfocusFile),
        };
        action.map_err(invalid)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::ReadFile(_) => ActionKind::ReadFile,
            Action::WriteFile(_) => ActionKind::WriteFile,
            Action::EditFile(_) => ActionKind::EditFile,
            Action::PatchFile(_) => ActionKind::PatchFile,
            Action::ListDir(_) => ActionKind::ListDir,
            Action::SearchFiles(_) => ActionKind::SearchFiles,
            Action::RunCommand(_) => ActionKind::RunCommand,
            Action::FocusFile(_) => ActionKind::FocusFile,
            Action::UnfocusFile(_) => ActionKind::UnfocusFile,
        }
    }

    /// The file or directory an action targets, as given by the model.
    pub fn target_path(&self) -> Option<&str> {
        match self {
            Action::ReadFile(a) => Some(&a.path),
            Action::WriteFile(a) => Some(&a.path),
            Action::EditFile(a) => Some(&a.path),
            Action::PatchFile(a) => Some(&a.path),
            Action::ListDir(a) => Some(&a.path),
            Action::SearchFiles(a) => Some(&a.path),
            Action::FocusFile(a) | Action::UnfocusFile(a) => Some(&a.path),
            Action::RunCommand(_) => None,
        }
    }

    pub fn mutates_files(&self) -> bool {
        matches!(
            self,
            Action::WriteFile(_) | Action::EditFile(_) | Action::PatchFile(_)
        )
    }

    /// Short human summary for approval prompts and logs.
    pub fn summary(&self) -> String {
        match self {
            Action::ReadFile(a) => format!("read {}", a.path),
            Action::WriteFile(a) => format!("write {} ({} bytes)", a.path, a.content.len()),
            Action::EditFile(a) => format!("edit {}", a.path),
            Action::PatchFile(a) => format!("patch {} ({})", a.path, a.op.name()),
            Action::ListDir(a) => format!("list {}", a.path),
            Action::SearchFiles(a) => format!("search {} for '{}'", a.path, a.term),
            Action::RunCommand(a) => format!("run `{}`", a.command),
            Action::FocusFile(a) => format!("focus {}", a.path),
            Action::UnfocusFile(a) => format!("unfocus {}", a.path),
        }
    }
}

/// What an action produced. Folded into one conversation turn, then dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn new(tool: impl Into<String>, output: impl Into<String>) -> Self {
        let output = output.into();
        let is_error = ERROR_MARKERS.iter().any(|m| output.starts_with(m));
        Self {
            tool: tool.into(),
            output,
            is_error,
        }
    }

    /// Text of the user turn that reports this result to the model.
    pub fn to_turn_text(&self) -> String {
        format!("Tool '{}' Output:\n{}", self.tool, self.output)
    }
}

/// Everything an action may touch. One per workspace.
pub struct ToolContext {
    pub workspace: PathBuf,
    pub versions: Arc<VersionStore>,
    pub focus: Arc<Mutex<FocusSet>>,
    pub shell: ShellSettings,
    pub backup_dir_name: String,
    pub events: Option<flume::Sender<AgentEvent>>,
    pub operator_input: Option<flume::Receiver<String>>,
}

impl ToolContext {
    pub fn new(
        workspace: PathBuf,
        versions: Arc<VersionStore>,
        focus: Arc<Mutex<FocusSet>>,
        shell: ShellSettings,
    ) -> Self {
        let backup_dir_name = versions
            .backup_dir()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| ".zion_backups".to_string());
        Self {
            workspace,
            versions,
            focus,
            shell,
            backup_dir_name,
            events: None,
            operator_input: None,
        }
    }

    pub fn resolve(&self, raw: &str) -> PathBuf {
        files::resolve_path(raw, &self.workspace)
    }

    pub fn lock_focus(&self) -> Result<MutexGuard<'_, FocusSet>> {
        self.focus
            .lock()
            .map_err(|e| anyhow::anyhow!("Focus set lock poisoned: {}", e))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// OpenAI-style function definition, exported by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

/// Dispatches validated actions against one [`ToolContext`].
pub struct ActionRegistry {
    ctx: ToolContext,
}

impl ActionRegistry {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ToolContext {
        &mut self.ctx
    }

    pub fn names(&self) -> Vec<String> {
        ActionKind::ALL.iter().map(|k| k.name().to_string()).collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDef> {
        ActionKind::ALL
            .iter()
            .map(|kind| ToolDef {
                tool_type: "function".to_string(),
                function: FunctionDef {
                    name: kind.name().to_string(),
                    description: kind.description().to_string(),
                    parameters: kind.parameters_schema(),
                },
            })
            .collect()
    }

    pub async fn execute(&self, action: &Action, cancel: &CancellationToken) -> ToolResult {
        let name = action.kind().name();
        let started = Instant::now();
        tracing::info!("Tool {} started: {}", name, action.summary());

        let ctx = &self.ctx;
        let outcome = match action {
            Action::ReadFile(args) => files::read_file(args, ctx).await,
            Action::WriteFile(args) => files::write_file(args, ctx).await,
            Action::EditFile(args) => files::edit_file(args, ctx).await,
            Action::PatchFile(args) => files::patch_file(args, ctx).await,
            Action::ListDir(args) => files::list_dir(args, ctx).await,
            Action::SearchFiles(args) => files::search_files(args, ctx).await,
            Action::RunCommand(args) => shell::run_command(args, ctx, cancel).await,
            Action::FocusFile(args) => context::focus_file(args, ctx),
            Action::UnfocusFile(args) => context::unfocus_file(args, ctx),
        };

        let output = match outcome {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Tool {} failed: {:#}", name, e);
                format!("Error: tool execution failed: {:#}", e)
            }
        };
        let result = ToolResult::new(name, safety::truncate_output(&output));
        tracing::info!(
            "Tool {} finished in {:?} (error: {})",
            name,
            started.elapsed(),
            result.is_error
        );
        result
    }
}

/// Argument deserializers that accept numbers or booleans sent as strings.
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn to_int(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(d)?;
        to_int(&value).ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {}", value)))
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let value = Value::deserialize(d)?;
        if value.is_null() {
            return Ok(None);
        }
        to_int(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {}", value)))
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        match Value::deserialize(d)? {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                other => Err(serde::de::Error::custom(format!("expected a boolean, got {}", other))),
            },
            other => Err(serde::de::Error::custom(format!("expected a boolean, got {}", other))),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> (tempfile::TempDir, ToolContext) {
    let dir = tempfile::tempdir().unwrap();
    let versions = Arc::new(VersionStore::open(dir.path(), ".zion_backups", 100).unwrap());
    let ctx = ToolContext::new(
        dir.path().to_path_buf(),
        versions,
        Arc::new(Mutex::new(FocusSet::default())),
        ShellSettings::default(),
    );
    (dir, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(tool: &str, args: Value) -> ToolInvocation {
        ToolInvocation::new(tool, args)
    }

    #[test]
    fn unknown_tool_is_its_own_error() {
        let err = Action::from_invocation(&invocation("delete_everything", json!({}))).unwrap_err();
        assert_eq!(err, ActionError::UnknownTool("delete_everything".into()));
        assert_eq!(err.to_string(), "Tool 'delete_everything' not found.");
    }

    #[test]
    fn missing_required_argument_is_invalid() {
        let err = Action::from_invocation(&invocation("read_file", json!({}))).unwrap_err();
        assert!(matches!(err, ActionError::InvalidArguments { .. }));
    }

    #[test]
    fn aliases_are_accepted() {
        let action = Action::from_invocation(&invocation(
            "search_files",
            json!({"dir_path": "src", "search_term": "todo"}),
        ))
        .unwrap();
        match action {
            Action::SearchFiles(args) => {
                assert_eq!(args.path, "src");
                assert_eq!(args.term, "todo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn patch_requires_known_operation() {
        let missing = Action::from_invocation(&invocation("patch_file", json!({"path": "a"}))).unwrap_err();
        assert!(missing.to_string().contains("'operation' argument is required"));

        let unknown = Action::from_invocation(&invocation(
            "patch_file",
            json!({"path": "a", "operation": "explode"}),
        ))
        .unwrap_err();
        assert!(unknown.to_string().contains("Unknown operation 'explode'"));

        let ok = Action::from_invocation(&invocation(
            "patch_file",
            json!({"file_path": "a", "operation": "delete_lines", "start_line": "2", "end_line": 4}),
        ))
        .unwrap();
        assert_eq!(ok.kind(), ActionKind::PatchFile);
    }

    #[test]
    fn result_error_flag_comes_from_marker() {
        assert!(ToolResult::new("x", "Error: nope").is_error);
        assert!(ToolResult::new("x", "VIOLATION: placeholder").is_error);
        assert!(!ToolResult::new("x", "Found Error: in log").is_error);
        assert_eq!(
            ToolResult::new("read_file", "hi").to_turn_text(),
            "Tool 'read_file' Output:\nhi"
        );
    }

    #[test]
    fn every_kind_round_trips_its_name_and_schema() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.parameters_schema()["type"], "object");
            assert!(kind.example().contains(kind.name()));
        }
    }

    #[test]
    fn categories_group_the_actions() {
        assert_eq!(ActionKind::RunCommand.category(), ToolCategory::Shell);
        assert_eq!(ActionKind::UnfocusFile.category().as_str(), "context");
        let file_system = ActionKind::ALL
            .iter()
            .filter(|k| k.category() == ToolCategory::FileSystem)
            .count();
        assert_eq!(file_system, 6);
    }

    #[tokio::test]
    async fn execute_runs_typed_action() {
        let (dir, ctx) = test_context();
        std::fs::write(dir.path().join("notes.txt"), "alpha\n").unwrap();
        let registry = ActionRegistry::new(ctx);
        let action =
            Action::from_invocation(&invocation("read_file", json!({"path": "notes.txt"}))).unwrap();
        let result = registry.execute(&action, &CancellationToken::new()).await;
        assert!(!result.is_error);
        assert_eq!(result.output, "alpha\n");
    }
}
