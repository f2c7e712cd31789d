//! Prompt assembly: master prompt, focused-files block, history and the
//! ephemeral corrections of the current step.

use std::path::Path;

use crate::conversation::Turn;
use crate::tools::ActionKind;

const README_PREVIEW_LINES: usize = 50;

const WORKFLOW: &str = r#"You are Zion, an expert coding agent working inside the operator's workspace. You follow a strict workflow.

## WORKFLOW

### 1. UNDERSTAND
Before changing anything, find out where you are.
- Run `list_dir` to see existing files.
- Run `read_file` on the code you are about to change.
- Never assume paths. Check the directory structure first.

### 2. PLAN
State your plan in plain text. Break complex tasks into steps.

### 3. EXECUTE
- One tool call per response.
- No placeholders. Write complete, working code.

### 4. VERIFY
- Read back the exact path you modified.
- If a tool reports "Error: File ... not found", run `list_dir` before trying again.
- Only say "Task Complete" once you have proof it works.

## TEXT IS INVISIBLE TO THE FILE SYSTEM
Code written in the chat is never saved. To create or change a file you MUST call
`write_file`, `edit_file` or `patch_file`.

## PATHS
Use paths relative to the workspace exactly as `list_dir` shows them. A file in
`folder/file.py` cannot be read as `file.py`.

## LOOP PREVENTION
- Do not repeat a call whose output you already have.
- Do not repeat a failing call unchanged; inspect the directory or the file first.
- When the work is verified, stop and summarize instead of touching the file again.

## FINISHING
Complete every part of the request before stopping. When you are done, answer in plain
text without a tool call.

## TOOL CALL FORMAT
Respond with exactly one JSON object inside a ```json code block:
{"tool": "<name>", "args": {...}}
"#;

/// The system prompt, with one line per action generated from the registry table.
pub fn master_prompt() -> String {
    let mut prompt = String::from(WORKFLOW);
    prompt.push_str("\n## TOOLS\n");
    for kind in ActionKind::ALL {
        prompt.push_str(&format!("- {}: {}\n  {}\n", kind.name(), kind.description(), kind.example()));
    }
    prompt
}

/// `[system: master] + [system: focus block] + history + corrections`.
pub fn assemble(
    master: &str,
    focus_block: Option<String>,
    history: &[Turn],
    corrections: &[String],
) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(history.len() + corrections.len() + 2);
    turns.push(Turn::system(master));
    if let Some(block) = focus_block {
        turns.push(Turn::system(block));
    }
    turns.extend_from_slice(history);
    turns.extend(corrections.iter().map(|c| Turn::user(c.clone())));
    turns
}

/// Initial user turn describing the workspace: root path, top-level listing and
/// the head of `README.md`.
pub fn workspace_primer(workspace: &Path) -> String {
    let listing = root_listing(workspace);
    let readme = readme_head(workspace).unwrap_or_else(|| "No README.md found.".to_string());
    format!(
        "PROJECT CONTEXT\n---------------\nWorkspace root: {}\n\nRoot files:\n{}\n\nREADME (first {} lines):\n{}\n---------------",
        workspace.display(),
        listing,
        README_PREVIEW_LINES,
        readme
    )
}

fn root_listing(workspace: &Path) -> String {
    let Ok(reader) = std::fs::read_dir(workspace) else {
        return "(unreadable)".to_string();
    };
    let mut entries: Vec<(String, bool)> = reader
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                return None;
            }
            let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
            Some((name, is_dir))
        })
        .collect();
    if entries.is_empty() {
        return "(empty directory)".to_string();
    }
    entries.sort();
    entries
        .into_iter()
        .map(|(name, is_dir)| format!("{} {}", if is_dir { "[DIR]" } else { "[FILE]" }, name))
        .collect::<Vec<_>>()
        .join("\n")
}

fn readme_head(workspace: &Path) -> Option<String> {
    let text = std::fs::read_to_string(workspace.join("README.md")).ok()?;
    Some(
        text.lines()
            .take(README_PREVIEW_LINES)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;

    #[test]
    fn master_prompt_lists_every_action() {
        let prompt = master_prompt();
        for kind in ActionKind::ALL {
            assert!(prompt.contains(kind.example()), "missing {}", kind.name());
        }
    }

    #[test]
    fn assemble_orders_system_focus_history_corrections() {
        let history = vec![Turn::user("do it"), Turn::assistant("ok")];
        let turns = assemble(
            "master",
            Some("focus".into()),
            &history,
            &["VIOLATION: use the tool".into()],
        );
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(turns[4].content, "VIOLATION: use the tool");

        let bare = assemble("master", None, &history, &[]);
        assert_eq!(bare.len(), 3);
    }

    #[test]
    fn primer_lists_root_and_readme_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let readme: String = (1..=80).map(|i| format!("line {}\n", i)).collect();
        std::fs::write(dir.path().join("README.md"), readme).unwrap();

        let primer = workspace_primer(dir.path());
        assert!(primer.contains("[DIR] src"));
        assert!(primer.contains("[FILE] README.md"));
        assert!(!primer.contains(".git"));
        assert!(primer.contains("line 50"));
        assert!(!primer.contains("line 51"));
    }

    #[test]
    fn primer_without_readme() {
        let dir = tempfile::tempdir().unwrap();
        assert!(workspace_primer(dir.path()).contains("No README.md found."));
    }
}
