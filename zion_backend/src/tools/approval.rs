//! Approval gate: which invocations run without asking the operator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalPolicy {
    /// Run without asking.
    AlwaysAllow,
    /// Only run tools in the safe set without asking.
    SafeSetOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    NeedsApproval { tool_name: String, description: String },
}

#[derive(Debug, Clone)]
pub struct ApprovalGate {
    safe_tools: HashSet<String>,
    policy: ApprovalPolicy,
}

impl ApprovalGate {
    pub fn new<I, S>(safe_tools: I, auto_approve: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            safe_tools: safe_tools.into_iter().map(Into::into).collect(),
            policy: if auto_approve {
                ApprovalPolicy::AlwaysAllow
            } else {
                ApprovalPolicy::SafeSetOnly
            },
        }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ApprovalPolicy) {
        tracing::info!("Approval policy set to {:?}", policy);
        self.policy = policy;
    }

    pub fn is_safe(&self, tool_name: &str) -> bool {
        self.safe_tools.contains(tool_name)
    }

    pub fn check(&self, tool_name: &str, description: &str) -> ApprovalDecision {
        if self.policy == ApprovalPolicy::AlwaysAllow || self.is_safe(tool_name) {
            return ApprovalDecision::Approved;
        }
        ApprovalDecision::NeedsApproval {
            tool_name: tool_name.to_string(),
            description: description.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_tools_are_approved() {
        let gate = ApprovalGate::new(["read_file", "list_dir"], false);
        assert_eq!(gate.check("read_file", "read a"), ApprovalDecision::Approved);
    }

    #[test]
    fn mutating_tools_need_approval() {
        let gate = ApprovalGate::new(["read_file"], false);
        assert!(matches!(
            gate.check("write_file", "write a"),
            ApprovalDecision::NeedsApproval { .. }
        ));
    }

    #[test]
    fn auto_approve_allows_everything() {
        let mut gate = ApprovalGate::new(Vec::<String>::new(), true);
        assert_eq!(gate.check("run_command", "rm -rf build"), ApprovalDecision::Approved);

        gate.set_policy(ApprovalPolicy::SafeSetOnly);
        assert!(matches!(
            gate.check("run_command", "rm -rf build"),
            ApprovalDecision::NeedsApproval { .. }
        ));
    }
}
