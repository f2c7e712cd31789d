//! Input limits and output cleanup around action execution.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;

/// Tool output longer than this is cut before it reaches the model (characters).
pub const MAX_OUTPUT_CHARS: usize = 50_000;

const MAX_JSON_DEPTH: usize = 10;
const MAX_STRING_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow,
    Block(String),
}

/// Reject argument payloads that are absurdly nested or carry megabyte strings.
pub fn validate_input(params: &Value) -> SafetyVerdict {
    if json_depth(params) > MAX_JSON_DEPTH {
        return SafetyVerdict::Block(format!(
            "argument nesting depth exceeds maximum of {}",
            MAX_JSON_DEPTH
        ));
    }
    if let Some(key) = find_large_string(params) {
        return SafetyVerdict::Block(format!(
            "argument '{}' exceeds {} bytes",
            key, MAX_STRING_BYTES
        ));
    }
    SafetyVerdict::Allow
}

/// Cut output at [`MAX_OUTPUT_CHARS`] on a char boundary and say so.
pub fn truncate_output(output: &str) -> String {
    let total = output.chars().count();
    if total <= MAX_OUTPUT_CHARS {
        return output.to_string();
    }
    let kept: String = output.chars().take(MAX_OUTPUT_CHARS).collect();
    format!(
        "{}\n\n[OUTPUT TRUNCATED: showing first {} of {} characters]",
        kept, MAX_OUTPUT_CHARS, total
    )
}

fn ansi_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07|\r").ok())
        .as_ref()
}

/// Remove terminal escape sequences and carriage returns from captured output.
pub fn strip_ansi(text: &str) -> String {
    match ansi_re() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        Value::Array(arr) => 1 + arr.iter().map(json_depth).max().unwrap_or(0),
        _ => 1,
    }
}

fn find_large_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.len() > MAX_STRING_BYTES => Some("(root)".to_string()),
        Value::Object(map) => map.iter().find_map(|(key, val)| match val {
            Value::String(s) if s.len() > MAX_STRING_BYTES => Some(key.clone()),
            other => find_large_string(other).map(|inner| format!("{}.{}", key, inner)),
        }),
        Value::Array(arr) => arr
            .iter()
            .enumerate()
            .find_map(|(i, val)| find_large_string(val).map(|inner| format!("[{}].{}", i, inner))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_arguments_pass() {
        let params = serde_json::json!({"command": "ls -la", "timeout": 30});
        assert_eq!(validate_input(&params), SafetyVerdict::Allow);
    }

    #[test]
    fn deep_nesting_is_blocked() {
        let mut val = serde_json::json!("leaf");
        for _ in 0..15 {
            val = serde_json::json!({"nested": val});
        }
        assert!(matches!(validate_input(&val), SafetyVerdict::Block(_)));
    }

    #[test]
    fn long_output_is_truncated_with_notice() {
        let long = "é".repeat(MAX_OUTPUT_CHARS + 10);
        let result = truncate_output(&long);
        assert!(result.contains("[OUTPUT TRUNCATED"));
        assert!(result.starts_with(&"é".repeat(100)));
    }

    #[test]
    fn short_output_is_untouched() {
        assert_eq!(truncate_output("hello"), "hello");
    }

    #[test]
    fn ansi_sequences_are_removed() {
        let raw = "\x1b[32mok\x1b[0m\r\n\x1b]0;title\x07done";
        assert_eq!(strip_ansi(raw), "ok\ndone");
    }
}
