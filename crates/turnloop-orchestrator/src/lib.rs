//! The turn-taking loop: chat/tool/approval op handling over the event
//! bus (spec §4.6–§4.8).
//!
//! Grounded on `runtime/orchestrator.py`'s `Orchestrator` dataclass and
//! its `handle`/`_continue_chat_operation`/`_handle_planned_tool_calls`/
//! `_handle_approval_decision` methods, `runtime/orchestrator_chat_loop.py`
//! for the exact auto-compact guard placement, and
//! `runtime/orchestrator_compaction.py` for `_perform_compaction` and
//! `apply_memory_summary_retention`. One `Orchestrator` per session
//! (spec §5's scheduling model): methods take `&mut self` and are not
//! meant to be called concurrently from multiple tasks.

mod approvals;
mod chat;
mod compaction;
mod tool_loop;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use turnloop_artifacts::ArtifactStore;
use turnloop_core::{
    new_id, ArtifactRef, CanonicalMessage, CanonicalMessageRole, Event, EventKind, Op, OpKind,
    ToolCall,
};
use turnloop_events::{EventBus, EventLogError, EventLogStore};
use turnloop_hitl::ApprovalStore;
use turnloop_llm::LlmClient;
use turnloop_policy::ToolPolicyEngine;
use turnloop_providers::ModelRouter;
use turnloop_session::SessionStore;
use turnloop_tools::ToolRuntime;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an autonomous engineering agent working inside a single project checkout. \
     Use the tools available to you to inspect and modify the project; ask for nothing you \
     can discover yourself. Be direct and terse in your replies.";

const MAX_TOOL_TURNS: usize = 8;
const SCHEMA_VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    EventLogAppend(#[from] turnloop_events::EventLogAppendError),
    #[error(transparent)]
    EventLogRead(#[from] EventLogError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Approval(#[from] turnloop_hitl::ApprovalStoreError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("op targets session {op_session_id}, orchestrator is bound to {bound_session_id}")]
    SessionMismatch { op_session_id: String, bound_session_id: String },
}

/// One orchestrator instance per session (spec §5). Holds every store
/// handle the turn loop needs plus the in-memory history it replays from
/// the event log on construction.
pub struct Orchestrator {
    pub project_root: PathBuf,
    pub session_id: String,
    pub event_bus: Arc<EventBus>,
    pub event_log_store: Arc<EventLogStore>,
    pub session_store: Arc<SessionStore>,
    pub artifact_store: Arc<ArtifactStore>,
    pub approval_store: Arc<ApprovalStore>,
    pub llm_client: Arc<LlmClient>,
    pub model_router: Arc<ModelRouter>,
    pub tool_runtime: ToolRuntime,
    pub policy_engine: ToolPolicyEngine,
    pub tools_enabled: bool,
    /// Whether the session has sealed `spec/` against tool writes.
    pub spec_sealed: bool,
    pub system_prompt: String,
    pub schema_version: String,
    pub max_tool_turns: usize,
    history: Vec<CanonicalMessage>,
    memory_summary: Option<String>,
    /// Per-turn auto-compact recursion guard (spec §4.6, §9 Open
    /// Question 3 / SPEC_FULL.md §D.3): a turn id is added here the
    /// first time auto-compact is attempted for it, so a freshly rebuilt
    /// request against the post-compaction history never re-triggers it.
    auto_compact_seen_turn_ids: HashSet<String>,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        project_root: PathBuf,
        session_id: String,
        event_bus: Arc<EventBus>,
        event_log_store: Arc<EventLogStore>,
        session_store: Arc<SessionStore>,
        artifact_store: Arc<ArtifactStore>,
        approval_store: Arc<ApprovalStore>,
        llm_client: Arc<LlmClient>,
        model_router: Arc<ModelRouter>,
        tool_runtime: ToolRuntime,
        policy_engine: ToolPolicyEngine,
        tools_enabled: bool,
        spec_sealed: bool,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            project_root,
            session_id,
            event_bus,
            event_log_store,
            session_store,
            artifact_store,
            approval_store,
            llm_client,
            model_router,
            tool_runtime,
            policy_engine,
            tools_enabled,
            spec_sealed,
            system_prompt: system_prompt.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            schema_version: SCHEMA_VERSION.to_string(),
            max_tool_turns: MAX_TOOL_TURNS,
            history: Vec::new(),
            memory_summary: None,
            auto_compact_seen_turn_ids: HashSet::new(),
        }
    }

    /// Builds an orchestrator for an existing session: replays history
    /// from the event log, loads the durable memory summary if any, and
    /// best-effort re-applies retention so a resumed prompt doesn't resend
    /// the full pre-compaction transcript.
    #[allow(clippy::too_many_arguments)]
    pub async fn for_session(
        project_root: PathBuf,
        session_id: String,
        event_bus: Arc<EventBus>,
        event_log_store: Arc<EventLogStore>,
        session_store: Arc<SessionStore>,
        artifact_store: Arc<ArtifactStore>,
        approval_store: Arc<ApprovalStore>,
        llm_client: Arc<LlmClient>,
        model_router: Arc<ModelRouter>,
        tool_runtime: ToolRuntime,
        policy_engine: ToolPolicyEngine,
        tools_enabled: bool,
        spec_sealed: bool,
        system_prompt: Option<String>,
    ) -> Result<Self, OrchestratorError> {
        let meta = session_store.get_session(&session_id).await?;
        let mut orchestrator = Self::new(
            project_root,
            session_id,
            event_bus,
            event_log_store,
            session_store,
            artifact_store,
            approval_store,
            llm_client,
            model_router,
            tool_runtime,
            policy_engine,
            tools_enabled,
            spec_sealed,
            system_prompt,
        );
        orchestrator.memory_summary = meta.memory_summary;
        orchestrator.load_history_from_events().await?;
        orchestrator.apply_memory_summary_retention().await?;
        Ok(orchestrator)
    }

    /// Entry point: validates session scope then dispatches by op kind
    /// (spec §4.6 "Entry: handle(op)").
    pub async fn handle(
        &mut self,
        op: Op,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), OrchestratorError> {
        if op.session_id != self.session_id {
            return Err(OrchestratorError::SessionMismatch {
                op_session_id: op.session_id,
                bound_session_id: self.session_id.clone(),
            });
        }
        match op.kind {
            OpKind::ApprovalDecision => self.handle_approval_decision(&op, timeout_s, cancel).await,
            OpKind::Chat => self.handle_chat(&op, timeout_s, cancel).await,
        }
    }

    /// Rebuilds in-memory history from the durable event log (spec §4.8).
    pub async fn load_history_from_events(&mut self) -> Result<(), OrchestratorError> {
        let events = self.event_log_store.read(&self.session_id, None).await?;
        let mut history = Vec::new();
        for event in events {
            self.replay_event_into(&event, &mut history).await;
        }
        self.history = history;
        Ok(())
    }

    async fn replay_event_into(&self, event: &Event, history: &mut Vec<CanonicalMessage>) {
        match event.kind {
            EventKind::OperationStarted => {
                if event.payload.get("op_kind").and_then(Value::as_str) != Some("chat") {
                    return;
                }
                if let Some(text) = self.read_ref_text(event.payload.get("input_ref")).await {
                    history.push(CanonicalMessage::user(text));
                }
            }
            EventKind::LlmResponseCompleted => {
                let content = self.read_ref_text(event.payload.get("output_ref")).await.unwrap_or_default();
                let descriptors = event.payload.get("tool_calls").and_then(Value::as_array).cloned().unwrap_or_default();
                let mut tool_calls = Vec::with_capacity(descriptors.len());
                for descriptor in &descriptors {
                    tool_calls.push(self.tool_call_from_descriptor(descriptor).await);
                }
                history.push(CanonicalMessage::assistant(content, tool_calls));
            }
            EventKind::ToolCallEnd => {
                if event.payload.get("status").and_then(Value::as_str) != Some("succeeded") {
                    return;
                }
                let Some(text) = self.read_ref_text(event.payload.get("tool_message_ref")).await else { return };
                let tool_call_id = event.payload.get("tool_call_id").and_then(Value::as_str).unwrap_or_default();
                let tool_name = event.payload.get("tool_name").and_then(Value::as_str).unwrap_or_default();
                history.push(CanonicalMessage::tool(text, tool_call_id, tool_name));
            }
            _ => {}
        }
    }

    async fn read_ref_text(&self, ref_value: Option<&Value>) -> Option<String> {
        let artifact_ref: ArtifactRef = serde_json::from_value(ref_value?.clone()).ok()?;
        self.artifact_store.get_text(&artifact_ref).await.ok()
    }

    async fn read_ref_json(&self, ref_value: Option<&Value>) -> Option<Value> {
        let artifact_ref: ArtifactRef = serde_json::from_value(ref_value?.clone()).ok()?;
        self.artifact_store.get_json(&artifact_ref).await.ok()
    }

    async fn tool_call_from_descriptor(&self, descriptor: &Value) -> ToolCall {
        let name = descriptor.get("tool_name").and_then(Value::as_str).unwrap_or_default().to_string();
        let tool_call_id = descriptor.get("tool_call_id").and_then(Value::as_str).map(String::from);
        let arguments = self
            .read_ref_json(descriptor.get("arguments_ref"))
            .await
            .and_then(|v| v.as_object().cloned())
            .map(|map| map.into_iter().collect())
            .unwrap_or_default();
        ToolCall { tool_call_id, name, arguments, raw_arguments: None, thought_signature: None }
    }

    /// Best-effort retention pass applied when resuming a session that
    /// already has a memory summary, so the next prompt doesn't resend
    /// the full pre-compaction transcript (`orchestrator_compaction.py`'s
    /// `apply_memory_summary_retention`). Silently no-ops if no summary
    /// or no MAIN profile is configured.
    pub async fn apply_memory_summary_retention(&mut self) -> Result<(), OrchestratorError> {
        let Some(summary) = self.memory_summary.clone() else { return Ok(()) };
        let Ok(resolved) = self
            .model_router
            .resolve(turnloop_core::ModelRole::Main, turnloop_core::ModelRequirements::default())
        else {
            return Ok(());
        };
        let settings = turnloop_context::settings_for_profile(resolved.profile.context_management);
        let context_limit = resolved.profile.limits.and_then(|l| l.context_limit_tokens);
        let retention = turnloop_context::apply_compaction_retention(
            &self.history,
            &summary,
            context_limit,
            settings.history_budget_ratio,
            settings.history_budget_fallback_tokens,
        );
        self.memory_summary = Some(retention.memory_summary);
        self.history = retention.retained_history;
        Ok(())
    }

    /// Appends an event to the bus (which persists unless the kind is
    /// ephemeral) and patches the session's `last_request_id`/
    /// `last_event_id` pointers.
    pub(crate) async fn emit(
        &self,
        kind: EventKind,
        payload: Value,
        request_id: Option<&str>,
        turn_id: Option<&str>,
        step_id: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let event_id = new_id("evt");
        let event = Event {
            kind,
            payload,
            session_id: self.session_id.clone(),
            event_id: event_id.clone(),
            timestamp: turnloop_core::now_ts_ms(),
            request_id: request_id.map(String::from),
            turn_id: turn_id.map(String::from),
            step_id: step_id.map(String::from),
            schema_version: Some(self.schema_version.clone()),
        };
        self.event_bus.publish(event).await?;

        let mut patch = json!({ "last_event_id": event_id });
        if let Some(request_id) = request_id {
            patch["last_request_id"] = Value::String(request_id.to_string());
        }
        self.session_store.update_session(&self.session_id, patch).await?;
        Ok(())
    }
}

fn role_str(role: CanonicalMessageRole) -> &'static str {
    match role {
        CanonicalMessageRole::System => "system",
        CanonicalMessageRole::User => "user",
        CanonicalMessageRole::Assistant => "assistant",
        CanonicalMessageRole::Tool => "tool",
    }
}

/// Collapses whitespace and truncates to `max_len` chars with no
/// trailing marker (`orchestrator.py::_summarize_text` — unlike
/// `turnloop-context`'s budget truncation, this helper produces a label
/// for an artifact's `summary` field, not a content replacement).
fn summarize_text(text: &str, max_len: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_len {
        collapsed
    } else {
        collapsed.chars().take(max_len.saturating_sub(1)).collect()
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

/// A readable, size-bounded stand-in for the full `CanonicalRequest`,
/// written as an audit artifact (spec §4.6 "Write a redacted
/// canonical-request artifact for audit"). Full message bodies are
/// already durable via their own `chat_user`/`chat_assistant`/
/// `tool_message` artifacts, so this only needs to be legible, not complete.
pub(crate) fn redact_canonical_request(request: &turnloop_core::CanonicalRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": role_str(m.role),
                "content_preview": truncate_preview(&m.content, 2000),
                "tool_call_id": m.tool_call_id,
                "tool_name": m.tool_name,
                "tool_calls": m.tool_calls.as_ref().map(|calls| {
                    calls.iter().map(|tc| json!({"tool_call_id": tc.tool_call_id, "name": tc.name})).collect::<Vec<_>>()
                }),
            })
        })
        .collect();
    json!({
        "system_preview": request.system.as_deref().map(|s| truncate_preview(s, 2000)),
        "messages": messages,
        "tool_names": request.tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
    })
}
