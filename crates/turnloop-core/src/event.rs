//! The canonical `Event` and `Op` shapes (spec §3, §6).
//!
//! Dynamic, duck-typed events in the source become a strongly typed kind
//! enum with a free-form JSON payload: the schema lives per-kind in the
//! orchestrator/bus code that constructs each payload, not in `Event`
//! itself. The open mapping is preserved only at the wire boundary
//! (`payload: serde_json::Value`), matching spec §9.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OperationStarted,
    OperationProgress,
    OperationCompleted,
    OperationFailed,
    OperationCancelled,

    ModelSelected,
    ModelResolutionFailed,

    LlmRequestStarted,
    LlmThinkingDelta,
    LlmResponseDelta,
    LlmResponseCompleted,
    LlmRequestFailed,

    ApprovalRequired,
    ApprovalGranted,
    ApprovalDenied,

    ToolCallStart,
    ToolCallProgress,
    ToolCallEnd,

    PlanUpdate,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::OperationStarted => "operation_started",
            EventKind::OperationProgress => "operation_progress",
            EventKind::OperationCompleted => "operation_completed",
            EventKind::OperationFailed => "operation_failed",
            EventKind::OperationCancelled => "operation_cancelled",
            EventKind::ModelSelected => "model_selected",
            EventKind::ModelResolutionFailed => "model_resolution_failed",
            EventKind::LlmRequestStarted => "llm_request_started",
            EventKind::LlmThinkingDelta => "llm_thinking_delta",
            EventKind::LlmResponseDelta => "llm_response_delta",
            EventKind::LlmResponseCompleted => "llm_response_completed",
            EventKind::LlmRequestFailed => "llm_request_failed",
            EventKind::ApprovalRequired => "approval_required",
            EventKind::ApprovalGranted => "approval_granted",
            EventKind::ApprovalDenied => "approval_denied",
            EventKind::ToolCallStart => "tool_call_start",
            EventKind::ToolCallProgress => "tool_call_progress",
            EventKind::ToolCallEnd => "tool_call_end",
            EventKind::PlanUpdate => "plan_update",
        }
    }

    /// Mergeable progress kinds: a later publish with the same merge key
    /// overwrites the pending entry instead of appending (spec §4.1).
    pub fn is_mergeable_progress(self) -> bool {
        matches!(self, EventKind::OperationProgress | EventKind::ToolCallProgress)
    }

    /// Ephemeral kinds: dispatched to subscribers but never persisted
    /// (spec §4.1, §8: "No event with kind llm_response_delta or
    /// llm_thinking_delta appears in the persisted event log").
    pub fn is_ephemeral(self) -> bool {
        matches!(self, EventKind::LlmResponseDelta | EventKind::LlmThinkingDelta)
    }
}

/// An immutable, append-only unit of the session's canonical history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub session_id: String,
    pub event_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}

impl Event {
    /// The key merge-then-dispatch progress events are deduplicated on:
    /// `(session_id, kind, request_id, turn_id, step_id)`.
    pub fn merge_key(&self) -> (String, &'static str, Option<String>, Option<String>, Option<String>) {
        (
            self.session_id.clone(),
            self.kind.as_str(),
            self.request_id.clone(),
            self.turn_id.clone(),
            self.step_id.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Chat,
    ApprovalDecision,
}

/// An external request submitted into the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub payload: Value,
    pub session_id: String,
    pub request_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
}
