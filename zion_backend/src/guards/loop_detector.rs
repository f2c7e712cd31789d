//! Detects an agent that keeps calling the same thing.
//!
//! Works on a bounded ring of executed calls, independent of the response guards.
//! Interventions only add corrective turns to the conversation.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use serde_json::Value;

use crate::config::LoopDetectionConfig;
use crate::interpreter::ToolInvocation;

const FILE_TOOLS: &[&str] = &["read_file", "write_file", "edit_file", "patch_file"];

/// One executed call, keyed by tool plus canonical JSON of its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub tool: String,
    pub args: String,
    pub path: Option<String>,
}

impl CallRecord {
    pub fn from_invocation(invocation: &ToolInvocation) -> Self {
        let path = ["path", "file_path", "dir_path"]
            .iter()
            .find_map(|key| invocation.args.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        Self {
            tool: invocation.tool.clone(),
            // serde_json maps are ordered by key, so this is canonical.
            args: invocation.args.to_string(),
            path,
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.tool, self.args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionKind {
    RepeatedCall,
    FileChurn,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intervention {
    pub kind: InterventionKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LoopDetector {
    history: VecDeque<CallRecord>,
    config: LoopDetectionConfig,
    unchecked: bool,
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.call_history_len),
            config,
            unchecked: false,
        }
    }

    pub fn record(&mut self, invocation: &ToolInvocation) {
        self.history.push_back(CallRecord::from_invocation(invocation));
        while self.history.len() > self.config.call_history_len.max(1) {
            self.history.pop_front();
        }
        self.unchecked = true;
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.unchecked = false;
    }

    /// Interventions warranted by the calls recorded since the last check.
    /// Returns nothing if no call was recorded in between.
    pub fn check(&mut self) -> Vec<Intervention> {
        if !self.unchecked {
            return Vec::new();
        }
        self.unchecked = false;

        let mut found = Vec::new();
        if let Some(intervention) = self.repeated_call() {
            found.push(intervention);
        }
        if let Some(intervention) = self.file_churn() {
            found.push(intervention);
        }
        found
    }

    fn repeated_call(&self) -> Option<Intervention> {
        let n = self.config.identical_call_threshold;
        if n < 2 || self.history.len() < n {
            return None;
        }
        let recent: Vec<String> = self.history.iter().rev().take(n).map(CallRecord::key).collect();
        if recent.iter().any(|k| k != &recent[0]) {
            return None;
        }
        Some(Intervention {
            kind: InterventionKind::RepeatedCall,
            message: format!(
                "LOOP DETECTED: You have called {} {} times in a row. If you have already \
                 received the output, YOU HAVE THE DATA. STOP REPEATING and MOVE TO THE NEXT \
                 PHASE (Plan or Execute). If you are stuck, try listing the directory or \
                 searching for files.",
                recent[0], n
            ),
        })
    }

    fn file_churn(&self) -> Option<Intervention> {
        let window = self.config.file_window;
        if self.history.len() < window {
            return None;
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in self.history.iter().rev().take(window) {
            if !FILE_TOOLS.contains(&record.tool.as_str()) {
                continue;
            }
            if let Some(path) = record.path.as_deref() {
                *counts.entry(path).or_default() += 1;
            }
        }
        let (path, count) = counts.into_iter().max_by_key(|(_, c)| *c)?;
        if count < self.config.file_touch_threshold {
            return None;
        }
        Some(Intervention {
            kind: InterventionKind::FileChurn,
            message: format!(
                "LOOP DETECTED: You have operated on '{}' {} times recently. The task appears \
                 to be complete. STOP MODIFYING THIS FILE and declare the task complete. Do NOT \
                 read, patch, or edit it again unless there is a clear error.",
                path, count
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(tool: &str, args: Value) -> ToolInvocation {
        ToolInvocation::new(tool, args)
    }

    #[test]
    fn three_identical_calls_fire_once() {
        let mut detector = LoopDetector::new(LoopDetectionConfig::default());
        let read = call("read_file", json!({"path": "a.rs"}));

        detector.record(&read);
        assert!(detector.check().is_empty());
        detector.record(&read);
        assert!(detector.check().is_empty());
        detector.record(&read);

        let fired = detector.check();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, InterventionKind::RepeatedCall);
        assert!(fired[0].message.contains("YOU HAVE THE DATA"));
        assert!(detector.check().is_empty());
    }

    #[test]
    fn argument_order_does_not_matter() {
        let a = CallRecord::from_invocation(&call("read_file", json!({"path": "x", "start_line": 1})));
        let b = CallRecord::from_invocation(&call("read_file", json!({"start_line": 1, "path": "x"})));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn ring_is_bounded() {
        let mut detector = LoopDetector::new(LoopDetectionConfig::default());
        for i in 0..25 {
            detector.record(&call("list_dir", json!({"path": format!("d{}", i)})));
        }
        assert_eq!(detector.len(), 10);
    }

    #[test]
    fn file_churn_detected_in_window() {
        let mut detector = LoopDetector::new(LoopDetectionConfig::default());
        let ops = [
            call("read_file", json!({"path": "app.js"})),
            call("edit_file", json!({"path": "app.js", "target": "a", "replacement": "b"})),
            call("list_dir", json!({"path": "."})),
            call("read_file", json!({"path": "app.js", "start_line": 2})),
            call("run_command", json!({"command": "npm test"})),
            call("patch_file", json!({"path": "app.js", "operation": "append", "content": "x"})),
        ];
        for op in &ops {
            detector.record(op);
        }
        let fired = detector.check();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, InterventionKind::FileChurn);
        assert!(fired[0].message.contains("STOP MODIFYING THIS FILE"));
    }

    #[test]
    fn varied_calls_do_not_fire() {
        let mut detector = LoopDetector::new(LoopDetectionConfig::default());
        for path in ["a", "b", "c", "d", "e", "f"] {
            detector.record(&call("read_file", json!({"path": path})));
        }
        assert!(detector.check().is_empty());
    }
}
