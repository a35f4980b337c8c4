//! The chat op: approval gating, the tool-turn loop, and the
//! streaming/non-streaming LLM call (spec §4.6).

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use turnloop_artifacts::PutMeta;
use turnloop_core::{
    new_id, CanonicalMessage, CanonicalRequest, ErrorCode, EventKind, ModelRequirements, ModelRole, Op,
};
use turnloop_hitl::{new_approval_record, ResumeKind};
use turnloop_llm::LlmStreamEvent;
use turnloop_providers::ResolvedModel;
use turnloop_tools::PlannedToolCall;

use crate::{summarize_text, Orchestrator, OrchestratorError};

const FLUSH_MIN_CHARS: usize = 32;
const FLUSH_MAX_IDLE: Duration = Duration::from_millis(80);

/// What a completed LLM turn needs the outer loop to do next.
pub(crate) enum TurnOutcome {
    Completed,
    ContinueToolLoop(Vec<PlannedToolCall>),
    /// A terminal event (failure/cancellation) was already emitted; stop.
    Stop,
}

impl Orchestrator {
    pub(crate) async fn handle_chat(
        &mut self,
        op: &Op,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), OrchestratorError> {
        let pending = self.approval_store.list(&self.session_id, Some(turnloop_hitl::ApprovalStatus::Pending), None).await?;
        if !pending.is_empty() {
            self.emit(
                EventKind::OperationFailed,
                json!({"op_kind": "chat", "error_code": ErrorCode::ApprovalPending.as_str(), "error": "an approval is already pending for this session"}),
                Some(&op.request_id),
                op.turn_id.as_deref(),
                None,
            )
            .await?;
            return Ok(());
        }

        let text = op.payload.get("text").and_then(Value::as_str).unwrap_or("").trim().to_string();
        if text.is_empty() {
            self.emit(
                EventKind::OperationFailed,
                json!({"op_kind": "chat", "error_code": ErrorCode::BadRequest.as_str(), "error": "text must not be empty"}),
                Some(&op.request_id),
                op.turn_id.as_deref(),
                None,
            )
            .await?;
            return Ok(());
        }

        let turn_id = op.turn_id.clone().unwrap_or_else(|| op.request_id.clone());

        let input_ref = self
            .artifact_store
            .put_text("chat_user", &text, PutMeta { summary: Some(summarize_text(&text, 120)), ..Default::default() })
            .await?;

        self.emit(
            EventKind::OperationStarted,
            json!({"op_kind": "chat", "input_ref": input_ref, "text_preview": summarize_text(&text, 200)}),
            Some(&op.request_id),
            Some(&turn_id),
            None,
        )
        .await?;

        self.history.push(CanonicalMessage::user(text));

        let require_approval = op.payload.get("require_approval").and_then(Value::as_bool).unwrap_or(false);
        if require_approval {
            let approval_id = new_id("appr");
            let risk_level = op.payload.get("risk_level").and_then(Value::as_str).unwrap_or("medium").to_string();
            let reason = op.payload.get("reason").and_then(Value::as_str).map(String::from);
            let diff_ref = op.payload.get("diff_ref").cloned();
            let record = new_approval_record(
                approval_id.clone(),
                self.session_id.clone(),
                op.request_id.clone(),
                turn_id.clone(),
                summarize_text("chat turn requires approval before continuing", 200),
                risk_level.clone(),
                reason.clone(),
                diff_ref.clone(),
                ResumeKind::ChatContinue,
                json!({"tools_enabled": self.tools_enabled}),
            );
            self.approval_store.create(record).await?;
            self.emit(
                EventKind::ApprovalRequired,
                json!({
                    "approval_id": approval_id,
                    "action_summary": "chat turn requires approval before continuing",
                    "risk_level": risk_level,
                    "options": ["approve", "deny"],
                    "reason": reason,
                    "diff_ref": diff_ref,
                }),
                Some(&op.request_id),
                Some(&turn_id),
                None,
            )
            .await?;
            return Ok(());
        }

        self.continue_chat_operation(&op.request_id, &turn_id, timeout_s, cancel).await
    }

    /// The bounded tool-turn loop (spec §4.6 `_continue_chat_operation`):
    /// build a request, resolve the main model, auto-compact at most once
    /// per turn if needed, call the LLM, then either finish or hand off to
    /// the tool-call loop.
    pub(crate) async fn continue_chat_operation(
        &mut self,
        request_id: &str,
        turn_id: &str,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), OrchestratorError> {
        let requirements = ModelRequirements { needs_tools: self.tools_enabled, ..Default::default() };

        for _ in 0..self.max_tool_turns {
            let resolved = loop {
                let resolved = match self.model_router.resolve(ModelRole::Main, requirements) {
                    Ok(r) => r,
                    Err(err) => {
                        self.emit(
                            EventKind::ModelResolutionFailed,
                            json!({"error": err.to_string(), "error_code": err.code().as_str()}),
                            Some(request_id),
                            Some(turn_id),
                            None,
                        )
                        .await?;
                        self.emit(
                            EventKind::OperationFailed,
                            json!({"op_kind": "chat", "error_code": err.code().as_str(), "error": err.to_string()}),
                            Some(request_id),
                            Some(turn_id),
                            None,
                        )
                        .await?;
                        return Ok(());
                    }
                };

                let request = self.build_chat_request();
                let estimated_input_tokens = request.messages.iter().map(turnloop_context::approx_tokens_from_message).sum::<u64>()
                    + request.system.as_deref().map(turnloop_context::approx_tokens_from_text).unwrap_or(0);
                let context_limit = turnloop_context::resolve_context_limit_tokens(resolved.profile.limits.and_then(|l| l.context_limit_tokens));
                let settings = turnloop_context::settings_for_profile(resolved.profile.context_management);

                let already_compacted_this_turn = self.auto_compact_seen_turn_ids.contains(turn_id);
                if !already_compacted_this_turn
                    && turnloop_context::should_auto_compact(estimated_input_tokens, Some(context_limit), settings.auto_compact_threshold_ratio)
                {
                    self.auto_compact_seen_turn_ids.insert(turn_id.to_string());
                    self.perform_compaction(request_id, turn_id, &resolved).await?;
                    continue;
                }

                break resolved;
            };

            let request = self.build_chat_request();

            let _ = self
                .artifact_store
                .put_json("canonical_request_redacted", &crate::redact_canonical_request(&request), PutMeta::default())
                .await?;

            self.emit(
                EventKind::ModelSelected,
                json!({"role": "main", "profile_id": resolved.profile.profile_id, "why": resolved.why}),
                Some(request_id),
                Some(turn_id),
                None,
            )
            .await?;

            let capabilities = resolved.profile.capabilities.with_provider_defaults(resolved.profile.provider_kind);
            let response = if capabilities.supports_streaming == Some(true) {
                self.run_llm_stream(request_id, turn_id, resolved, requirements, request, timeout_s, cancel.clone()).await?
            } else {
                self.run_llm_complete(request_id, turn_id, resolved, requirements, request, timeout_s, cancel.clone()).await?
            };

            let Some(response) = response else { return Ok(()) };

            match self.finish_llm_response(request_id, turn_id, response).await? {
                TurnOutcome::Completed => return Ok(()),
                TurnOutcome::Stop => return Ok(()),
                TurnOutcome::ContinueToolLoop(planned) => {
                    if !self.tools_enabled {
                        self.emit(
                            EventKind::OperationFailed,
                            json!({"op_kind": "chat", "error_code": ErrorCode::ToolCallsDisabled.as_str(), "error": "model requested tool calls but tools are disabled"}),
                            Some(request_id),
                            Some(turn_id),
                            None,
                        )
                        .await?;
                        return Ok(());
                    }
                    let should_continue = self.handle_planned_tool_calls(planned, request_id, turn_id, None).await?;
                    if !should_continue {
                        return Ok(());
                    }
                }
            }
        }

        self.emit(
            EventKind::OperationFailed,
            json!({"op_kind": "chat", "error_code": ErrorCode::ToolLoopLimit.as_str(), "error": format!("exceeded {} tool turns", self.max_tool_turns)}),
            Some(request_id),
            Some(turn_id),
            None,
        )
        .await?;
        Ok(())
    }

    fn build_chat_request(&self) -> CanonicalRequest {
        let tools = if self.tools_enabled { self.tool_runtime.tool_specs() } else { Vec::new() };
        let mut system = self.system_prompt.clone();
        if let Some(summary) = &self.memory_summary {
            if !summary.trim().is_empty() {
                system.push_str("\n\nDurable session summary from prior compaction:\n\n");
                system.push_str(summary.trim());
            }
        }
        CanonicalRequest { system: Some(system), messages: self.history.clone(), tools, params: Default::default() }
    }

    /// Streams the turn, buffering text deltas and flushing them as
    /// `llm_response_delta` on a size/newline/idle-time heuristic (spec
    /// §4.6). Falls back to a one-shot `run_llm_complete` if the network
    /// fails before any chunk arrives.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_llm_stream(
        &mut self,
        request_id: &str,
        turn_id: &str,
        resolved: ResolvedModel,
        requirements: ModelRequirements,
        request: CanonicalRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<Option<turnloop_llm::LlmResponse>, OrchestratorError> {
        self.emit(EventKind::LlmRequestStarted, json!({"profile_id": resolved.profile.profile_id, "streaming": true}), Some(request_id), Some(turn_id), None).await?;

        let mut rx = match self.llm_client.stream(resolved.role, requirements, request.clone(), timeout_s, cancel.clone()).await {
            Ok(rx) => rx,
            Err(err) => {
                return self.fail_llm_request(request_id, turn_id, &err).await;
            }
        };

        let mut buffer = String::new();
        let mut last_flush = Instant::now();
        let mut any_chunk = false;
        let mut final_response = None;
        let mut stream_err = None;

        while let Some(item) = rx.recv().await {
            match item {
                Ok(LlmStreamEvent::TextDelta(text)) => {
                    any_chunk = true;
                    buffer.push_str(&text);
                    if buffer.len() >= FLUSH_MIN_CHARS || buffer.contains('\n') || last_flush.elapsed() >= FLUSH_MAX_IDLE {
                        self.flush_delta(&mut buffer, request_id, turn_id).await?;
                        last_flush = Instant::now();
                    }
                }
                Ok(LlmStreamEvent::ThinkingDelta(text)) => {
                    any_chunk = true;
                    self.emit(EventKind::LlmThinkingDelta, json!({"text": text}), Some(request_id), Some(turn_id), None).await?;
                }
                Ok(LlmStreamEvent::ToolCallDelta(_)) => {
                    any_chunk = true;
                }
                Ok(LlmStreamEvent::ToolCall(_)) => {
                    any_chunk = true;
                }
                Ok(LlmStreamEvent::Completed(response)) => {
                    final_response = Some(response);
                }
                Err(err) => {
                    stream_err = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = stream_err {
            if !any_chunk && err.code == ErrorCode::NetworkError {
                self.emit(
                    EventKind::OperationProgress,
                    json!({"op_kind": "chat", "note": "stream failed before any chunk arrived, retrying non-streaming"}),
                    Some(request_id),
                    Some(turn_id),
                    None,
                )
                .await?;
                return self.run_llm_complete(request_id, turn_id, resolved, requirements, request, timeout_s, cancel).await;
            }
            self.flush_delta(&mut buffer, request_id, turn_id).await?;
            if err.code == ErrorCode::Cancelled {
                self.emit(EventKind::LlmRequestFailed, json!({"error_code": err.code.as_str(), "error": err.to_string()}), Some(request_id), Some(turn_id), None).await?;
                self.emit(EventKind::OperationCancelled, json!({"op_kind": "chat", "phase": "llm_stream"}), Some(request_id), Some(turn_id), None).await?;
                return Ok(None);
            }
            return self.fail_llm_request(request_id, turn_id, &err).await;
        }

        self.flush_delta(&mut buffer, request_id, turn_id).await?;
        Ok(final_response)
    }

    async fn flush_delta(&self, buffer: &mut String, request_id: &str, turn_id: &str) -> Result<(), OrchestratorError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.emit(EventKind::LlmResponseDelta, json!({"text": buffer.as_str()}), Some(request_id), Some(turn_id), None).await?;
        buffer.clear();
        Ok(())
    }

    async fn fail_llm_request(
        &self,
        request_id: &str,
        turn_id: &str,
        err: &turnloop_core::LlmRequestError,
    ) -> Result<Option<turnloop_llm::LlmResponse>, OrchestratorError> {
        self.emit(EventKind::LlmRequestFailed, json!({"error_code": err.code.as_str(), "error": err.to_string()}), Some(request_id), Some(turn_id), None).await?;
        self.emit(
            EventKind::OperationFailed,
            json!({"op_kind": "chat", "error_code": err.code.as_str(), "error": err.to_string()}),
            Some(request_id),
            Some(turn_id),
            None,
        )
        .await?;
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run_llm_complete(
        &mut self,
        request_id: &str,
        turn_id: &str,
        resolved: ResolvedModel,
        requirements: ModelRequirements,
        request: CanonicalRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<Option<turnloop_llm::LlmResponse>, OrchestratorError> {
        self.emit(EventKind::LlmRequestStarted, json!({"profile_id": resolved.profile.profile_id, "streaming": false}), Some(request_id), Some(turn_id), None).await?;
        match self.llm_client.complete(resolved.role, requirements, request, timeout_s, cancel).await {
            Ok(response) => {
                if response.fallback_used {
                    self.emit(
                        EventKind::OperationProgress,
                        json!({"op_kind": "chat", "note": "response produced via streaming->complete fallback"}),
                        Some(request_id),
                        Some(turn_id),
                        None,
                    )
                    .await?;
                }
                Ok(Some(response))
            }
            Err(err) => {
                if err.code == ErrorCode::Cancelled {
                    self.emit(EventKind::LlmRequestFailed, json!({"error_code": err.code.as_str(), "error": err.to_string()}), Some(request_id), Some(turn_id), None).await?;
                    self.emit(EventKind::OperationCancelled, json!({"op_kind": "chat", "phase": "llm_complete"}), Some(request_id), Some(turn_id), None).await?;
                    return Ok(None);
                }
                self.fail_llm_request(request_id, turn_id, &err).await
            }
        }
    }

    /// Plans any tool calls the assistant requested, persists the
    /// assistant turn, and emits `llm_response_completed` (spec §4.6 tail,
    /// shared by both the streaming and non-streaming paths).
    pub(crate) async fn finish_llm_response(
        &mut self,
        request_id: &str,
        turn_id: &str,
        response: turnloop_llm::LlmResponse,
    ) -> Result<TurnOutcome, OrchestratorError> {
        let content = response.message.content.clone();
        let tool_calls = response.message.tool_calls.clone().unwrap_or_default();

        let mut planned_calls = Vec::with_capacity(tool_calls.len());
        for tc in &tool_calls {
            let tool_execution_id = new_id("texec");
            let tool_call_id = tc.tool_call_id.clone().unwrap_or_else(|| new_id("call"));
            let arguments = Value::Object(tc.arguments.clone().into_iter().collect());
            match self.tool_runtime.plan(tool_execution_id, tc.name.clone(), tool_call_id, arguments).await {
                Ok(planned) => planned_calls.push(planned),
                Err(err) => {
                    self.emit(
                        EventKind::OperationFailed,
                        json!({"op_kind": "chat", "error_code": ErrorCode::ToolCallPlanFailed.as_str(), "error": err.to_string()}),
                        Some(request_id),
                        Some(turn_id),
                        None,
                    )
                    .await?;
                    return Ok(TurnOutcome::Stop);
                }
            }
        }

        let output_ref = self
            .artifact_store
            .put_text("chat_assistant", &content, PutMeta { summary: Some(summarize_text(&content, 120)), ..Default::default() })
            .await?;

        self.history.push(CanonicalMessage::assistant(content, tool_calls));

        let tool_call_descriptors: Vec<Value> = planned_calls
            .iter()
            .map(|p| json!({"tool_execution_id": p.tool_execution_id, "tool_name": p.tool_name, "tool_call_id": p.tool_call_id, "arguments_ref": p.arguments_ref}))
            .collect();

        self.emit(
            EventKind::LlmResponseCompleted,
            json!({
                "output_ref": output_ref,
                "tool_calls": tool_call_descriptors,
                "usage": response.usage,
                "stop_reason": response.finish_reason,
            }),
            Some(request_id),
            Some(turn_id),
            None,
        )
        .await?;

        self.session_store
            .update_session(&self.session_id, json!({"last_usage": response.usage}))
            .await?;

        if planned_calls.is_empty() {
            self.emit(EventKind::OperationCompleted, json!({"op_kind": "chat"}), Some(request_id), Some(turn_id), None).await?;
            return Ok(TurnOutcome::Completed);
        }

        Ok(TurnOutcome::ContinueToolLoop(planned_calls))
    }
}
