//! The approval-decision op: validate, record the decision, then resume
//! whichever operation was paused (spec §4.7 approval state machine).

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use turnloop_core::{ErrorCode, EventKind, Op};
use turnloop_hitl::{ApprovalDecision, ApprovalRecord, ResumeKind};
use turnloop_tools::PlannedToolCall;

use crate::{Orchestrator, OrchestratorError};

impl Orchestrator {
    pub(crate) async fn handle_approval_decision(
        &mut self,
        op: &Op,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), OrchestratorError> {
        let approval_id = op.payload.get("approval_id").and_then(Value::as_str).map(String::from);
        let decision_str = op.payload.get("decision").and_then(Value::as_str);
        let decision = match decision_str {
            Some("approve") => Some(ApprovalDecision::Approve),
            Some("deny") => Some(ApprovalDecision::Deny),
            _ => None,
        };

        let (Some(approval_id), Some(decision)) = (approval_id, decision) else {
            self.emit(
                EventKind::OperationFailed,
                json!({"op_kind": "approval_decision", "error_code": ErrorCode::ApprovalDecisionInvalid.as_str(), "error": "approval_id and a decision of approve|deny are required"}),
                Some(&op.request_id),
                op.turn_id.as_deref(),
                None,
            )
            .await?;
            return Ok(());
        };

        let record = match self.approval_store.get(&approval_id).await {
            Ok(record) => record,
            Err(_) => {
                self.emit(
                    EventKind::OperationFailed,
                    json!({"op_kind": "approval_decision", "error_code": ErrorCode::ApprovalNotFound.as_str(), "error": format!("no such approval: {approval_id}")}),
                    Some(&op.request_id),
                    op.turn_id.as_deref(),
                    None,
                )
                .await?;
                return Ok(());
            }
        };

        if record.session_id != self.session_id {
            self.emit(
                EventKind::OperationFailed,
                json!({"op_kind": "approval_decision", "error_code": ErrorCode::ApprovalSessionMismatch.as_str(), "error": "approval belongs to a different session"}),
                Some(&op.request_id),
                op.turn_id.as_deref(),
                None,
            )
            .await?;
            return Ok(());
        }
        if record.status != turnloop_hitl::ApprovalStatus::Pending {
            self.emit(
                EventKind::OperationFailed,
                json!({"op_kind": "approval_decision", "error_code": ErrorCode::ApprovalNotPending.as_str(), "error": format!("approval {approval_id} is not pending")}),
                Some(&op.request_id),
                op.turn_id.as_deref(),
                None,
            )
            .await?;
            return Ok(());
        }

        let note = op.payload.get("note").and_then(Value::as_str).map(String::from);
        self.approval_store.decide(&approval_id, decision).await?;

        match decision {
            ApprovalDecision::Approve => {
                self.emit(
                    EventKind::ApprovalGranted,
                    json!({"approval_id": approval_id, "decision": "approve", "note": note}),
                    Some(&record.request_id),
                    Some(&record.turn_id),
                    None,
                )
                .await?;
                self.emit(
                    EventKind::OperationCompleted,
                    json!({"op_kind": "approval_decision"}),
                    Some(&op.request_id),
                    op.turn_id.as_deref(),
                    None,
                )
                .await?;
                self.resume_from_approval(&record, timeout_s, cancel).await
            }
            ApprovalDecision::Deny => {
                self.emit(
                    EventKind::ApprovalDenied,
                    json!({"approval_id": approval_id, "decision": "deny", "note": note}),
                    Some(&record.request_id),
                    Some(&record.turn_id),
                    None,
                )
                .await?;

                if record.resume_kind == ResumeKind::ToolChain {
                    if let Some(first) = self.first_resume_tool_call(&record)? {
                        self.emit(
                            EventKind::ToolCallEnd,
                            json!({
                                "tool_execution_id": first.tool_execution_id,
                                "tool_name": first.tool_name,
                                "tool_call_id": first.tool_call_id,
                                "status": "cancelled",
                                "error": "Approval denied",
                            }),
                            Some(&record.request_id),
                            Some(&record.turn_id),
                            Some(&first.tool_execution_id),
                        )
                        .await?;
                    }
                }

                self.emit(
                    EventKind::OperationCancelled,
                    json!({"op_kind": "chat"}),
                    Some(&record.request_id),
                    Some(&record.turn_id),
                    None,
                )
                .await?;
                self.emit(
                    EventKind::OperationCompleted,
                    json!({"op_kind": "approval_decision"}),
                    Some(&op.request_id),
                    op.turn_id.as_deref(),
                    None,
                )
                .await?;
                Ok(())
            }
        }
    }

    fn resume_tool_calls(&self, record: &ApprovalRecord) -> Result<Vec<PlannedToolCall>, OrchestratorError> {
        let value = record.resume_payload.get("tool_calls").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(value)?)
    }

    fn first_resume_tool_call(&self, record: &ApprovalRecord) -> Result<Option<PlannedToolCall>, OrchestratorError> {
        Ok(self.resume_tool_calls(record)?.into_iter().next())
    }

    async fn resume_from_approval(
        &mut self,
        record: &ApprovalRecord,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), OrchestratorError> {
        match record.resume_kind {
            ResumeKind::ChatContinue => self.continue_chat_operation(&record.request_id, &record.turn_id, timeout_s, cancel).await,
            ResumeKind::ToolChain => {
                let tool_calls = self.resume_tool_calls(record)?;
                let skip_id = tool_calls.first().map(|p| p.tool_execution_id.clone());
                let should_continue = self
                    .handle_planned_tool_calls(tool_calls, &record.request_id, &record.turn_id, skip_id.as_deref())
                    .await?;
                if should_continue {
                    self.continue_chat_operation(&record.request_id, &record.turn_id, timeout_s, cancel).await
                } else {
                    Ok(())
                }
            }
        }
    }
}
