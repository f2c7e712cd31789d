//! Validators that reject a model turn and force a corrective retry.
//!
//! Guards see the raw response text and the parsed invocation (if any). A firing
//! guard yields a [`GuardViolation`] whose message is appended to the in-flight
//! prompt for the next attempt; it never reaches the stored conversation.

pub mod loop_detector;

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::Serialize;

use crate::config::LoopDetectionConfig;
use crate::interpreter::ToolInvocation;

pub use loop_detector::{CallRecord, Intervention, InterventionKind, LoopDetector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    Quality,
    Simulation,
    MentionWithoutCall,
    Repetition,
}

impl GuardKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardKind::Quality => "quality",
            GuardKind::Simulation => "simulation",
            GuardKind::MentionWithoutCall => "mention_without_call",
            GuardKind::Repetition => "repetition",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardViolation {
    pub kind: GuardKind,
    pub correction: String,
}

impl GuardViolation {
    fn new(kind: GuardKind, correction: impl Into<String>) -> Self {
        Self {
            kind,
            correction: correction.into(),
        }
    }
}

fn code_block_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(\w*)\n.*?\n```").ok())
        .as_ref()
}

/// Ordered response checks. Repetition runs before parsing; the rest after.
#[derive(Debug, Clone)]
pub struct GuardPipeline {
    known_tools: Vec<String>,
    repetition_min_lines: usize,
    repetition_min_unique_ratio: f64,
}

impl GuardPipeline {
    pub fn new(known_tools: Vec<String>, thresholds: &LoopDetectionConfig) -> Self {
        Self {
            known_tools,
            repetition_min_lines: thresholds.repetition_min_lines,
            repetition_min_unique_ratio: thresholds.repetition_min_unique_ratio,
        }
    }

    /// Pre-parse check for degenerate, looping output.
    pub fn check_raw(&self, text: &str) -> Option<GuardViolation> {
        self.repetition(text)
    }

    /// Post-parse checks, run in order: simulation, then mention-without-call.
    pub fn check_parsed(
        &self,
        text: &str,
        invocation: Option<&ToolInvocation>,
    ) -> Option<GuardViolation> {
        if invocation.is_some() {
            return None;
        }
        self.simulation(text).or_else(|| self.mention_without_call(text))
    }

    /// Placeholder check on the content of a parsed `write_file` / `patch_file` call.
    pub fn check_quality(&self, invocation: &ToolInvocation) -> Option<GuardViolation> {
        if !matches!(invocation.tool.as_str(), "write_file" | "patch_file") {
            return None;
        }
        let content = invocation.args.get("content").and_then(|v| v.as_str())?;
        placeholder_violation(content).map(|msg| GuardViolation::new(GuardKind::Quality, msg))
    }

    fn repetition(&self, text: &str) -> Option<GuardViolation> {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.len() <= self.repetition_min_lines {
            return None;
        }
        let unique: std::collections::HashSet<&str> = lines.iter().copied().collect();
        let ratio = unique.len() as f64 / lines.len() as f64;
        if ratio >= self.repetition_min_unique_ratio {
            return None;
        }
        Some(GuardViolation::new(
            GuardKind::Repetition,
            "CRITICAL: Your response is extremely repetitive. Stop repeating the same \
             sentences. Focus on the task and use the appropriate tool.",
        ))
    }

    /// A code block other than `json`/`plan` with no tool call means the model
    /// described the change instead of making it.
    fn simulation(&self, text: &str) -> Option<GuardViolation> {
        if !text.contains("```") {
            return None;
        }
        let re = code_block_re()?;
        let wrote_code = re.captures_iter(text).any(|caps| {
            let lang = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            !lang.starts_with("json") && !lang.starts_with("plan")
        });
        if !wrote_code {
            return None;
        }
        Some(GuardViolation::new(
            GuardKind::Simulation,
            "VIOLATION: You wrote code in the chat. This is strictly FORBIDDEN. Text in \
             the chat never reaches the file system. You MUST use the 'write_file' tool to \
             create code. Retry and use the tool.",
        ))
    }

    fn mention_without_call(&self, text: &str) -> Option<GuardViolation> {
        let mentioned = self.known_tools.iter().find(|tool| {
            text.contains(&format!("\"{}\"", tool))
                || text.contains(&format!("'{}'", tool))
                || text.contains(&format!("Command: {}", tool))
        })?;
        Some(GuardViolation::new(
            GuardKind::MentionWithoutCall,
            format!(
                "VIOLATION: You mentioned using '{}' but did not provide the JSON tool call. \
                 You MUST output tool calls in the format: \
                 {{\"tool\": \"name\", \"args\": {{...}}}} inside a code block.",
                mentioned
            ),
        ))
    }
}

/// Quality check applied by `write_file` and `patch_file` before anything is written.
///
/// Content with fewer than three non-blank lines that are all comments or
/// placeholder chatter is rejected with a `VIOLATION:` message.
pub fn placeholder_violation(content: &str) -> Option<String> {
    let stripped = content.trim();
    let lines: Vec<&str> = stripped
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() || lines.len() >= 3 {
        return None;
    }

    let is_placeholder = lines.iter().all(|line| {
        let lower = line.to_lowercase();
        line.starts_with("<!--")
            || line.starts_with("//")
            || line.starts_with('#')
            || lower.contains("placeholder")
            || lower.contains("updated")
            || lower.contains("modified")
    });
    if !is_placeholder {
        return None;
    }

    let preview: String = stripped.chars().take(100).collect();
    Some(format!(
        "VIOLATION: Content appears to be a placeholder comment, not real code. You must \
         write the ACTUAL implementation, not a comment about it. Rejected content: {}",
        preview
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> GuardPipeline {
        GuardPipeline::new(
            vec!["read_file".into(), "write_file".into()],
            &LoopDetectionConfig::default(),
        )
    }

    #[test]
    fn repetition_fires_on_degenerate_output() {
        let text = "I will now fix it.\n".repeat(40);
        let violation = pipeline().check_raw(&text).unwrap();
        assert_eq!(violation.kind, GuardKind::Repetition);
    }

    #[test]
    fn repetition_ignores_short_or_varied_text() {
        assert!(pipeline().check_raw(&"same\n".repeat(30)).is_none());
        let varied: String = (0..50).map(|i| format!("line {}\n", i)).collect();
        assert!(pipeline().check_raw(&varied).is_none());
    }

    #[test]
    fn quality_checks_only_content_writing_calls() {
        let placeholder = ToolInvocation::new(
            "write_file",
            serde_json::json!({"path": "a.css", "content": "/* styles updated */"}),
        );
        let violation = pipeline().check_quality(&placeholder).unwrap();
        assert_eq!(violation.kind, GuardKind::Quality);

        let read = ToolInvocation::new("read_file", serde_json::json!({"path": "a.css"}));
        assert!(pipeline().check_quality(&read).is_none());

        let real = ToolInvocation::new(
            "write_file",
            serde_json::json!({"path": "a.py", "content": "def add(a, b):\n    return a + b\n"}),
        );
        assert!(pipeline().check_quality(&real).is_none());
    }

    #[test]
    fn simulation_fires_for_code_without_call() {
        let text = "Here is the fix:\n```rust\nfn main() {}\n```";
        let violation = pipeline().check_parsed(text, None).unwrap();
        assert_eq!(violation.kind, GuardKind::Simulation);
    }

    #[test]
    fn plan_and_json_blocks_are_allowed() {
        let text = "```plan\n1. read\n2. edit\n```";
        assert!(pipeline().check_parsed(text, None).is_none());
    }

    #[test]
    fn guards_are_silent_when_a_call_was_parsed() {
        let text = "```python\nprint(1)\n```";
        let call = ToolInvocation::new("read_file", serde_json::json!({"path": "a"}));
        assert!(pipeline().check_parsed(text, Some(&call)).is_none());
    }

    #[test]
    fn mention_without_call_names_the_tool() {
        let violation = pipeline()
            .check_parsed("I should use 'read_file' on main.rs next.", None)
            .unwrap();
        assert_eq!(violation.kind, GuardKind::MentionWithoutCall);
        assert!(violation.correction.contains("'read_file'"));

        let violation = pipeline()
            .check_parsed("Command: write_file", None)
            .unwrap();
        assert_eq!(violation.kind, GuardKind::MentionWithoutCall);
    }

    #[test]
    fn placeholder_content_is_rejected() {
        assert!(placeholder_violation("// updated the handler\n").is_some());
        assert!(placeholder_violation("<!-- placeholder -->").is_some());
        assert!(placeholder_violation("# TODO\n# later\n").is_some());
    }

    #[test]
    fn real_content_passes_quality_check() {
        assert!(placeholder_violation("X").is_none());
        assert!(placeholder_violation("fn main() {}\n").is_none());
        assert!(placeholder_violation("// a\n// b\n// c\n").is_none());
    }
}
