//! Approval-gated tool execution (spec §4.7): inspect, maybe pause for
//! approval, execute, append the tool result to history.

use serde_json::{json, Value};

use turnloop_core::{new_id, CanonicalMessage, ErrorCode, EventKind};
use turnloop_hitl::{new_approval_record, ResumeKind};
use turnloop_policy::{Decision, InspectRequest};
use turnloop_tools::PlannedToolCall;

use crate::{Orchestrator, OrchestratorError};

const SHELL_LIKE_TOOLS: &[&str] = &["run_command", "run_shell", "shell_exec", "run_pty_cmd"];

impl Orchestrator {
    /// Runs `planned_calls` in order. Returns `Ok(true)` if every call
    /// executed successfully and the chat turn loop should continue,
    /// `Ok(false)` if execution paused (approval required) or stopped
    /// (denied/failed/cancelled) and a terminal or pausing event was
    /// already emitted.
    pub(crate) async fn handle_planned_tool_calls(
        &mut self,
        planned_calls: Vec<PlannedToolCall>,
        request_id: &str,
        turn_id: &str,
        skip_approval_tool_execution_id: Option<&str>,
    ) -> Result<bool, OrchestratorError> {
        for (i, planned) in planned_calls.iter().enumerate() {
            let already_approved = skip_approval_tool_execution_id == Some(planned.tool_execution_id.as_str());

            let shell_command = if SHELL_LIKE_TOOLS.contains(&planned.tool_name.as_str()) {
                planned.arguments.get("command").and_then(Value::as_str)
            } else {
                None
            };

            let inspection = self.policy_engine.inspect(InspectRequest {
                tool_name: &planned.tool_name,
                arguments: &planned.arguments,
                spec_sealed: self.spec_sealed,
                shell_command,
                preview: None,
            });

            if !already_approved {
                match inspection.decision {
                    Decision::Deny => {
                        self.emit(
                            EventKind::ToolCallEnd,
                            json!({
                                "tool_execution_id": planned.tool_execution_id,
                                "tool_name": planned.tool_name,
                                "tool_call_id": planned.tool_call_id,
                                "status": "denied",
                                "error_code": inspection.error_code.unwrap_or(ErrorCode::ToolDenied).as_str(),
                                "error": inspection.reason,
                            }),
                            Some(request_id),
                            Some(turn_id),
                            Some(&planned.tool_execution_id),
                        )
                        .await?;
                        self.emit(
                            EventKind::OperationFailed,
                            json!({"op_kind": "chat", "error_code": ErrorCode::ToolDenied.as_str(), "error": inspection.reason}),
                            Some(request_id),
                            Some(turn_id),
                            None,
                        )
                        .await?;
                        return Ok(false);
                    }
                    Decision::RequireApproval => {
                        let approval_id = new_id("appr");
                        let remaining: Vec<PlannedToolCall> = planned_calls[i..].to_vec();
                        let record = new_approval_record(
                            approval_id.clone(),
                            self.session_id.clone(),
                            request_id.to_string(),
                            turn_id.to_string(),
                            inspection.action_summary.clone(),
                            inspection.risk_level.as_str().to_string(),
                            inspection.reason.clone(),
                            None,
                            ResumeKind::ToolChain,
                            json!({"tool_calls": remaining}),
                        );
                        self.approval_store.create(record).await?;
                        self.emit(
                            EventKind::ApprovalRequired,
                            json!({
                                "approval_id": approval_id,
                                "action_summary": inspection.action_summary,
                                "risk_level": inspection.risk_level,
                                "options": ["approve", "deny"],
                                "reason": inspection.reason,
                                "diff_ref": Value::Null,
                                "tool_execution_id": planned.tool_execution_id,
                                "tool_name": planned.tool_name,
                                "tool_call_id": planned.tool_call_id,
                                "summary": inspection.action_summary,
                                "arguments_ref": planned.arguments_ref,
                            }),
                            Some(request_id),
                            Some(turn_id),
                            Some(&planned.tool_execution_id),
                        )
                        .await?;
                        return Ok(false);
                    }
                    Decision::Allow => {}
                }
            }

            self.emit(
                EventKind::ToolCallStart,
                json!({
                    "tool_execution_id": planned.tool_execution_id,
                    "tool_name": planned.tool_name,
                    "tool_call_id": planned.tool_call_id,
                    "summary": inspection.action_summary,
                    "arguments_ref": planned.arguments_ref,
                }),
                Some(request_id),
                Some(turn_id),
                Some(&planned.tool_execution_id),
            )
            .await?;

            let result = self.tool_runtime.execute(planned).await?;

            self.emit(
                EventKind::ToolCallEnd,
                json!({
                    "tool_execution_id": result.tool_execution_id,
                    "tool_name": planned.tool_name,
                    "tool_call_id": planned.tool_call_id,
                    "status": if result.ok { "succeeded" } else { "failed" },
                    "duration_ms": result.duration_ms,
                    "output_ref": result.output_ref,
                    "tool_message_ref": result.tool_message_ref,
                    "error_code": result.error_code,
                }),
                Some(request_id),
                Some(turn_id),
                Some(&planned.tool_execution_id),
            )
            .await?;

            if !result.ok {
                self.emit(
                    EventKind::OperationFailed,
                    json!({"op_kind": "chat", "error_code": result.error_code.unwrap_or(ErrorCode::ToolFailed).as_str(), "error": result.tool_message_content}),
                    Some(request_id),
                    Some(turn_id),
                    None,
                )
                .await?;
                return Ok(false);
            }

            let content = serde_json::to_string(&result.tool_message_content).unwrap_or_default();
            self.history.push(CanonicalMessage::tool(content, planned.tool_call_id.clone(), planned.tool_name.clone()));
        }

        Ok(true)
    }
}
