//! Tool inspection policy (spec §4.4): approval modes, risk classes, the
//! `spec_sealed` cross-cutting guard, and the session allowlist upgrade.
//!
//! Grounded on `agentic_loop.rs`'s `execute_with_hitl_generic` control flow
//! (planning-mode / policy-deny / constraint-apply / auto-approve-bypass
//! ordering) and `qbit-core::hitl`'s `RiskLevel`/`ToolApprovalConfig`
//! shapes, generalized to the three named approval modes.

pub mod config;
pub mod risk;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_core::ArtifactRef;

pub use config::{load_tool_approval_config, PolicyConfigLoadError};
pub use risk::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    Strict,
    Standard,
    Trusted,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        ApprovalMode::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    RequireApproval,
    Deny,
}

/// An allowlist entry matching shell commands by prefix, optionally scoped
/// to a cwd (spec §6 `policy/tool_approvals.json`:
/// `{"shell__run_allow": [{"command_prefix": "...", "cwd": "..."?}]}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellAllowEntry {
    pub command_prefix: String,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolApprovalConfig {
    /// Workflow tools that always require approval regardless of mode
    /// (e.g. spec-apply / spec-seal), per spec §4.4.
    #[serde(default)]
    pub always_require_approval: BTreeSet<String>,
    #[serde(default)]
    pub shell_allow: Vec<ShellAllowEntry>,
}

/// A previously computed preview the tool runtime attaches when it knows
/// how to produce one; the patch-engine/diff logic itself is out of
/// scope (spec.md Non-goals), this type only carries the result through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPreview {
    Arguments(Value),
    CommandLine(String),
    Diff(ArtifactRef),
}

pub struct InspectRequest<'a> {
    pub tool_name: &'a str,
    pub arguments: &'a Value,
    /// Whether the session has sealed the `spec/` subtree against writes.
    pub spec_sealed: bool,
    /// Shell command line, if this tool is a shell-exec style tool.
    pub shell_command: Option<&'a str>,
    pub preview: Option<ToolPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionResult {
    pub decision: Decision,
    pub action_summary: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<turnloop_core::ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<ToolPreview>,
}

pub struct ToolPolicyEngine {
    pub mode: ApprovalMode,
    pub config: ToolApprovalConfig,
}

impl ToolPolicyEngine {
    pub fn new(mode: ApprovalMode, config: ToolApprovalConfig) -> Self {
        Self { mode, config }
    }

    fn modifies_spec_path(tool_name: &str, arguments: &Value) -> bool {
        let is_write_like = matches!(
            tool_name,
            "write_file" | "create_file" | "edit_file" | "delete_file" | "project__apply_edits" | "apply_patch"
        );
        if !is_write_like {
            return false;
        }
        arguments
            .get("path")
            .and_then(Value::as_str)
            .map(|p| p.starts_with("spec/") || p.contains("/spec/"))
            .unwrap_or(false)
    }

    fn shell_allowed(&self, command: &str) -> bool {
        self.config
            .shell_allow
            .iter()
            .any(|entry| command.starts_with(entry.command_prefix.as_str()))
    }

    pub fn inspect(&self, request: InspectRequest<'_>) -> InspectionResult {
        let risk_level = RiskLevel::for_tool(request.tool_name);
        let action_summary = summarize(request.tool_name, request.arguments);

        if request.spec_sealed && Self::modifies_spec_path(request.tool_name, request.arguments) {
            return InspectionResult {
                decision: Decision::Deny,
                action_summary,
                risk_level,
                reason: Some("spec/ is sealed against modification".to_string()),
                error_code: Some(turnloop_core::ErrorCode::ToolDenied),
                preview: request.preview,
            };
        }

        let always_requires = self.config.always_require_approval.contains(request.tool_name);

        let mut decision = if always_requires {
            Decision::RequireApproval
        } else {
            match self.mode {
                ApprovalMode::Trusted => Decision::Allow,
                ApprovalMode::Strict => Decision::RequireApproval,
                ApprovalMode::Standard => {
                    if risk_level == RiskLevel::Low {
                        Decision::Allow
                    } else {
                        Decision::RequireApproval
                    }
                }
            }
        };

        // Session allowlist can upgrade a require_approval shell call to
        // allow, but never overrides an `always_require_approval` entry.
        if decision == Decision::RequireApproval && !always_requires {
            if let Some(command) = request.shell_command {
                if self.shell_allowed(command) {
                    decision = Decision::Allow;
                }
            }
        }

        let reason = match decision {
            Decision::RequireApproval if self.mode == ApprovalMode::Strict => {
                Some("strict mode requires approval for every tool call".to_string())
            }
            Decision::RequireApproval if always_requires => {
                Some("this tool always requires approval".to_string())
            }
            Decision::RequireApproval => Some(format!("{} is {} risk", request.tool_name, risk_level.as_str())),
            _ => None,
        };

        InspectionResult {
            decision,
            action_summary,
            risk_level,
            reason,
            error_code: None,
            preview: request.preview,
        }
    }
}

fn summarize(tool_name: &str, arguments: &Value) -> String {
    match arguments {
        Value::Object(map) if !map.is_empty() => {
            let mut parts: Vec<String> = map
                .iter()
                .take(3)
                .map(|(k, v)| format!("{k}={}", truncate_preview(&v.to_string(), 40)))
                .collect();
            parts.sort();
            format!("{tool_name}({})", parts.join(", "))
        }
        _ => format!("{tool_name}()"),
    }
}

fn truncate_preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine(mode: ApprovalMode) -> ToolPolicyEngine {
        ToolPolicyEngine::new(mode, ToolApprovalConfig::default())
    }

    #[test]
    fn trusted_mode_always_allows() {
        let engine = engine(ApprovalMode::Trusted);
        let result = engine.inspect(InspectRequest {
            tool_name: "run_shell",
            arguments: &json!({"command": "rm -rf /"}),
            spec_sealed: false,
            shell_command: Some("rm -rf /"),
            preview: None,
        });
        assert_eq!(result.decision, Decision::Allow);
    }

    #[test]
    fn strict_mode_always_requires_approval_even_for_reads() {
        let engine = engine(ApprovalMode::Strict);
        let result = engine.inspect(InspectRequest {
            tool_name: "read_file",
            arguments: &json!({"path": "a.txt"}),
            spec_sealed: false,
            shell_command: None,
            preview: None,
        });
        assert_eq!(result.decision, Decision::RequireApproval);
    }

    #[test]
    fn standard_mode_allows_low_risk_requires_high_risk() {
        let engine = engine(ApprovalMode::Standard);
        let read = engine.inspect(InspectRequest {
            tool_name: "read_file",
            arguments: &json!({}),
            spec_sealed: false,
            shell_command: None,
            preview: None,
        });
        assert_eq!(read.decision, Decision::Allow);

        let shell = engine.inspect(InspectRequest {
            tool_name: "run_shell",
            arguments: &json!({"command": "ls"}),
            spec_sealed: false,
            shell_command: Some("ls"),
            preview: None,
        });
        assert_eq!(shell.decision, Decision::RequireApproval);
    }

    #[test]
    fn spec_sealed_denies_writes_under_spec_regardless_of_mode() {
        let engine = engine(ApprovalMode::Trusted);
        let result = engine.inspect(InspectRequest {
            tool_name: "write_file",
            arguments: &json!({"path": "spec/plan.md"}),
            spec_sealed: true,
            shell_command: None,
            preview: None,
        });
        assert_eq!(result.decision, Decision::Deny);
        assert_eq!(result.error_code, Some(turnloop_core::ErrorCode::ToolDenied));
    }

    #[test]
    fn allowlist_upgrades_matching_shell_command_to_allow() {
        let config = ToolApprovalConfig {
            always_require_approval: Default::default(),
            shell_allow: vec![ShellAllowEntry { command_prefix: "git status".to_string(), cwd: None }],
        };
        let engine = ToolPolicyEngine::new(ApprovalMode::Standard, config);
        let result = engine.inspect(InspectRequest {
            tool_name: "run_shell",
            arguments: &json!({"command": "git status --short"}),
            spec_sealed: false,
            shell_command: Some("git status --short"),
            preview: None,
        });
        assert_eq!(result.decision, Decision::Allow);
    }

    #[test]
    fn always_require_approval_overrides_trusted_mode_and_allowlist() {
        let config = ToolApprovalConfig {
            always_require_approval: BTreeSet::from(["spec_apply".to_string()]),
            shell_allow: vec![],
        };
        let engine = ToolPolicyEngine::new(ApprovalMode::Trusted, config);
        let result = engine.inspect(InspectRequest {
            tool_name: "spec_apply",
            arguments: &json!({}),
            spec_sealed: false,
            shell_command: None,
            preview: None,
        });
        assert_eq!(result.decision, Decision::RequireApproval);
    }
}
