//! Tool risk classification (grounded on `qbit-core::hitl::RiskLevel`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// Hardcoded classification table, carried from the teacher's
    /// `RiskLevel::for_tool`. Tool names are the out-of-scope black boxes
    /// spec.md names by example (`project__apply_edits` etc.); the table
    /// below classifies by family, matching the teacher's approach of
    /// exact names plus a `sub_agent_` prefix rule.
    pub fn for_tool(tool_name: &str) -> RiskLevel {
        const LOW: &[&str] = &[
            "read_file",
            "grep_file",
            "list_files",
            "list_directory",
            "search_files",
            "web_fetch",
            "get_errors",
        ];
        const MEDIUM: &[&str] = &["write_file", "create_file", "edit_file"];
        const HIGH: &[&str] =
            &["run_command", "run_shell", "shell_exec", "run_pty_cmd", "project__apply_edits", "apply_patch"];
        const CRITICAL: &[&str] = &["delete_file", "execute_code"];

        if CRITICAL.contains(&tool_name) {
            return RiskLevel::Critical;
        }
        if HIGH.contains(&tool_name) {
            return RiskLevel::High;
        }
        if MEDIUM.contains(&tool_name) || tool_name.starts_with("sub_agent_") {
            return RiskLevel::Medium;
        }
        if LOW.contains(&tool_name) {
            return RiskLevel::Low;
        }
        // Unknown tools default to high risk, matching the teacher: an
        // unrecognized tool is treated as more dangerous than known reads.
        RiskLevel::High
    }
}
