//! The LLM client: `complete()`/`stream()` (spec §4.3).
//!
//! Grounded on `llm/client.py` (the dispatch-by-provider-kind shape) and
//! `client_exec_{openai_compatible,anthropic,gemini_internal}.py` (one
//! execution strategy per wire shape); cancellation/watchdog wiring is
//! grounded on `client_stream_guard.py` (see `watchdog.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turnloop_core::{new_id, CanonicalRequest, ErrorCode, LlmRequestError, ModelProfile, ModelRequirements, ModelRole, ProviderKind};
use turnloop_providers::{adapter_for, ModelRouter, PreparedRequest};

use crate::response_parse;
use crate::tool_call_builder::{AnthropicToolCallBuilder, OpenAiToolCallBuilder};
use crate::trace::TraceSink;
use crate::types::{LlmResponse, LlmStreamEvent, ToolCallDelta};
use crate::watchdog::{self, ProgressTracker, TimeoutPhase};
use crate::http_status;

const DEFAULT_FIRST_EVENT_TIMEOUT_S: f64 = 30.0;

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    router: Arc<ModelRouter>,
    trace: Option<TraceSink>,
}

impl LlmClient {
    pub fn new(router: Arc<ModelRouter>, trace: Option<TraceSink>) -> Self {
        Self { http: reqwest::Client::new(), router, trace }
    }

    /// Non-streaming call with a single retry on a retryable error code
    /// (spec §4.3's retryable set: timeout, rate_limit, server_error,
    /// network_error).
    pub async fn complete(
        &self,
        role: ModelRole,
        requirements: ModelRequirements,
        request: CanonicalRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<LlmResponse, LlmRequestError> {
        let request_id = new_id("req");
        let resolved = self
            .router
            .resolve(role, requirements)
            .map_err(|e| LlmRequestError::new(e.code(), e.to_string()))?;
        let adapter = adapter_for(resolved.profile.provider_kind);
        let prepared = adapter.prepare_request(&resolved.profile, &request).map_err(|e| {
            LlmRequestError::new(e.code(), e.to_string()).with_profile(
                format!("{:?}", resolved.profile.provider_kind),
                resolved.profile.profile_id.clone(),
                resolved.profile.model_name.clone(),
            )
        })?;

        if let Some(trace) = &self.trace {
            let _ = trace
                .write_canonical_request(&request_id, &serde_json::to_value(&request).unwrap_or_default())
                .await;
            let _ = trace
                .write_prepared_request(&request_id, &serde_json::to_value(&prepared.redacted()).unwrap_or_default())
                .await;
        }

        let mut result = self.send_once(&resolved.profile, &prepared, timeout_s, cancel.clone(), &request_id).await;
        if let Err(err) = &result {
            if err.code.is_retryable() {
                tracing::warn!(code = %err.code, request_id, "complete() retrying once after retryable error");
                result = self.send_once(&resolved.profile, &prepared, timeout_s, cancel, &request_id).await;
            }
        }

        if let Some(trace) = &self.trace {
            match &result {
                Ok(resp) => {
                    let _ = trace.write_response(&request_id, resp.raw.as_ref().unwrap_or(&Value::Null)).await;
                }
                Err(err) => {
                    let _ = trace.write_error(&request_id, &serde_json::to_value(err).unwrap_or_default()).await;
                }
            }
        }
        result
    }

    async fn send_once(
        &self,
        profile: &ModelProfile,
        prepared: &PreparedRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
        request_id: &str,
    ) -> Result<LlmResponse, LlmRequestError> {
        let response = self.send_raw(profile, prepared, timeout_s, cancel, request_id).await?;
        let status = response.status();
        if !status.is_success() {
            let code = http_status::error_code_for_status(status.as_u16());
            let body_text = response.text().await.unwrap_or_default();
            let mut err = LlmRequestError::new(code, truncate(&body_text, 500)).with_profile(
                format!("{:?}", profile.provider_kind),
                profile.profile_id.clone(),
                profile.model_name.clone(),
            );
            err.status_code = Some(status.as_u16());
            err.request_id = Some(request_id.to_string());
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmRequestError::new(ErrorCode::ResponseValidation, e.to_string()))?;

        match profile.provider_kind {
            ProviderKind::OpenaiCompatible => response_parse::parse_openai_response(body),
            ProviderKind::Anthropic => response_parse::parse_anthropic_response(body),
            ProviderKind::GeminiInternal => response_parse::parse_gemini_response(body),
        }
    }

    async fn send_raw(
        &self,
        profile: &ModelProfile,
        prepared: &PreparedRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
        request_id: &str,
    ) -> Result<reqwest::Response, LlmRequestError> {
        let method = reqwest::Method::from_bytes(prepared.method.as_bytes()).unwrap_or(reqwest::Method::POST);
        let mut builder = self.http.request(method, &prepared.url).json(&prepared.json);
        for (key, value) in &prepared.headers {
            builder = builder.header(key, value);
        }
        if let Some(t) = timeout_s {
            builder = builder.timeout(Duration::from_secs_f64(t));
        }

        let send_fut = builder.send();
        let result = match &cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(LlmRequestError::new(ErrorCode::Cancelled, "request cancelled before send completed"));
                    }
                    result = send_fut => result,
                }
            }
            None => send_fut.await,
        };

        result.map_err(|e| {
            let code = if e.is_timeout() { ErrorCode::Timeout } else { ErrorCode::NetworkError };
            let mut err = LlmRequestError::new(code, e.to_string()).with_profile(
                format!("{:?}", profile.provider_kind),
                profile.profile_id.clone(),
                profile.model_name.clone(),
            );
            err.request_id = Some(request_id.to_string());
            err
        })
    }

    /// Streaming call. Gemini is non-streaming per spec §4.3: a single
    /// `complete()` call is issued and replayed as a synthetic one-shot
    /// event sequence. OpenAI-compatible and Anthropic stream via SSE.
    pub async fn stream(
        &self,
        role: ModelRole,
        requirements: ModelRequirements,
        request: CanonicalRequest,
        timeout_s: Option<f64>,
        cancel: Option<CancellationToken>,
    ) -> Result<mpsc::UnboundedReceiver<Result<LlmStreamEvent, LlmRequestError>>, LlmRequestError> {
        let request_id = new_id("req");
        let resolved = self
            .router
            .resolve(role, requirements)
            .map_err(|e| LlmRequestError::new(e.code(), e.to_string()))?;

        if resolved.profile.provider_kind == ProviderKind::GeminiInternal {
            let (tx, rx) = mpsc::unbounded_channel();
            let response = self.complete(resolved.role, resolved.requirements, request, timeout_s, cancel).await?;
            replay_as_stream(&response, &tx);
            let _ = tx.send(Ok(LlmStreamEvent::Completed(response)));
            return Ok(rx);
        }

        let adapter = adapter_for(resolved.profile.provider_kind);
        let mut prepared = adapter.prepare_request(&resolved.profile, &request).map_err(|e| {
            LlmRequestError::new(e.code(), e.to_string()).with_profile(
                format!("{:?}", resolved.profile.provider_kind),
                resolved.profile.profile_id.clone(),
                resolved.profile.model_name.clone(),
            )
        })?;
        if let Value::Object(obj) = &mut prepared.json {
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        if let Some(trace) = &self.trace {
            let _ = trace
                .write_canonical_request(&request_id, &serde_json::to_value(&request).unwrap_or_default())
                .await;
            let _ = trace
                .write_prepared_request(&request_id, &serde_json::to_value(&prepared.redacted()).unwrap_or_default())
                .await;
        }

        let first_event_timeout =
            Duration::from_secs_f64(timeout_s.unwrap_or(DEFAULT_FIRST_EVENT_TIMEOUT_S).max(0.01));
        let stream_cancel = CancellationToken::new();
        let _closer = cancel.clone().map(|external| watchdog::spawn_cancel_closer(external, stream_cancel.clone()));
        let tracker = ProgressTracker::new();
        let watchdog_handle = watchdog::spawn_idle_watchdog(tracker.clone(), stream_cancel.clone(), first_event_timeout, first_event_timeout);

        let send_fut = self
            .send_raw(&resolved.profile, &prepared, timeout_s, Some(stream_cancel.clone()), &request_id)
            .await;

        let response = match send_fut {
            Ok(r) => r,
            Err(err) if err.code == ErrorCode::NetworkError => {
                // Streaming fallback: no chunk ever arrived, retry via complete().
                tracing::info!(request_id, "stream() falling back to complete() after network_error");
                let mut fallback = self.complete(resolved.role, resolved.requirements, request, timeout_s, cancel).await?;
                fallback.fallback_used = true;
                let (tx, rx) = mpsc::unbounded_channel();
                replay_as_stream(&fallback, &tx);
                let _ = tx.send(Ok(LlmStreamEvent::Completed(fallback)));
                return Ok(rx);
            }
            Err(err) => return Err(err),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let provider_kind = resolved.profile.provider_kind;
        let trace = self.trace.clone();
        let request_id_owned = request_id.clone();

        tokio::spawn(async move {
            let result = match provider_kind {
                ProviderKind::OpenaiCompatible => {
                    drive_openai_stream(response, &tx, &tracker, trace.as_ref(), &request_id_owned).await
                }
                ProviderKind::Anthropic => {
                    drive_anthropic_stream(response, &tx, &tracker, trace.as_ref(), &request_id_owned).await
                }
                ProviderKind::GeminiInternal => unreachable!("gemini_internal handled above"),
            };
            watchdog_handle.stop();
            if let Err(err) = result {
                if let Some(phase) = watchdog_handle.timed_out_phase() {
                    let phase_str = match phase {
                        TimeoutPhase::FirstEvent => "first_event",
                        TimeoutPhase::Idle => "idle",
                    };
                    let mut timeout_err = LlmRequestError::new(ErrorCode::Timeout, format!("stream watchdog timed out ({phase_str})"));
                    timeout_err.request_id = Some(request_id_owned.clone());
                    let _ = tx.send(Err(timeout_err));
                } else {
                    let _ = tx.send(Err(err));
                }
            }
        });

        Ok(rx)
    }
}

fn replay_as_stream(response: &LlmResponse, tx: &mpsc::UnboundedSender<Result<LlmStreamEvent, LlmRequestError>>) {
    if !response.message.content.is_empty() {
        let _ = tx.send(Ok(LlmStreamEvent::TextDelta(response.message.content.clone())));
    }
    if let Some(tool_calls) = &response.message.tool_calls {
        for tc in tool_calls {
            let _ = tx.send(Ok(LlmStreamEvent::ToolCall(tc.clone())));
        }
    }
}

async fn drive_openai_stream(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<Result<LlmStreamEvent, LlmRequestError>>,
    tracker: &ProgressTracker,
    trace: Option<&TraceSink>,
    request_id: &str,
) -> Result<(), LlmRequestError> {
    let mut lines = SseLineReader::new(response);
    let mut builders: HashMap<u32, OpenAiToolCallBuilder> = HashMap::new();
    let mut content = String::new();
    let mut usage = None;

    while let Some(line) = lines.next_data_line().await? {
        if line == "[DONE]" {
            break;
        }
        let chunk: Value = serde_json::from_str(&line)
            .map_err(|e| LlmRequestError::new(ErrorCode::ResponseValidation, format!("bad SSE chunk: {e}")))?;
        tracker.mark_progress();
        if let Some(trace) = trace {
            let _ = trace.append_provider_stream_line(request_id, &chunk).await;
        }

        let Some(delta) = chunk.get("choices").and_then(|c| c.get(0)).and_then(|c| c.get("delta")) else { continue };
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            content.push_str(text);
            let _ = tx.send(Ok(LlmStreamEvent::TextDelta(text.to_string())));
        }
        if let Some(tool_call_deltas) = delta.get("tool_calls").and_then(Value::as_array) {
            for tcd in tool_call_deltas {
                let index = tcd.get("index").and_then(Value::as_u64).unwrap_or(0) as u32;
                let id = tcd.get("id").and_then(Value::as_str).map(String::from);
                let function = tcd.get("function");
                let name = function.and_then(|f| f.get("name")).and_then(Value::as_str).map(String::from);
                let args_fragment = function.and_then(|f| f.get("arguments")).and_then(Value::as_str).unwrap_or("");

                let builder = builders.entry(index).or_insert_with(|| OpenAiToolCallBuilder::new(id.clone(), name.clone()));
                if builder.tool_call_id.is_none() {
                    builder.tool_call_id = id.clone();
                }
                if builder.name.is_none() {
                    builder.name = name.clone();
                }
                builder.append_arguments(args_fragment);

                let _ = tx.send(Ok(LlmStreamEvent::ToolCallDelta(ToolCallDelta {
                    index,
                    tool_call_id: id,
                    name,
                    arguments_fragment: Some(args_fragment.to_string()),
                })));
            }
        }
        if let Some(u) = chunk.get("usage") {
            usage = Some(crate::types::LlmUsage {
                prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                completion_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
                total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
            });
        }
    }

    let mut tool_calls = Vec::new();
    for (_, builder) in builders.into_iter().collect::<std::collections::BTreeMap<_, _>>() {
        let tool_call = builder.build()?;
        let _ = tx.send(Ok(LlmStreamEvent::ToolCall(tool_call.clone())));
        tool_calls.push(tool_call);
    }

    let response = LlmResponse {
        message: turnloop_core::CanonicalMessage::assistant(content, tool_calls),
        usage,
        finish_reason: None,
        raw: None,
        fallback_used: false,
    };
    if let Some(trace) = trace {
        let _ = trace.write_response(request_id, &serde_json::to_value(&response).unwrap_or_default()).await;
    }
    let _ = tx.send(Ok(LlmStreamEvent::Completed(response)));
    Ok(())
}

async fn drive_anthropic_stream(
    response: reqwest::Response,
    tx: &mpsc::UnboundedSender<Result<LlmStreamEvent, LlmRequestError>>,
    tracker: &ProgressTracker,
    trace: Option<&TraceSink>,
    request_id: &str,
) -> Result<(), LlmRequestError> {
    let mut lines = SseLineReader::new(response);
    let mut builders: HashMap<u64, AnthropicToolCallBuilder> = HashMap::new();
    let mut content = String::new();
    let mut usage = None;
    let mut finish_reason = None;

    while let Some(line) = lines.next_data_line().await? {
        let event: Value = serde_json::from_str(&line)
            .map_err(|e| LlmRequestError::new(ErrorCode::ResponseValidation, format!("bad SSE event: {e}")))?;
        tracker.mark_progress();
        if let Some(trace) = trace {
            let _ = trace.append_provider_stream_line(request_id, &event).await;
        }

        match event.get("type").and_then(Value::as_str) {
            Some("content_block_start") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = event.get("content_block") {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        let id = block.get("id").and_then(Value::as_str).map(String::from);
                        let name = block.get("name").and_then(Value::as_str).map(String::from);
                        builders.insert(index, AnthropicToolCallBuilder::new(id, name));
                    }
                }
            }
            Some("content_block_delta") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(delta) = event.get("delta") {
                    match delta.get("type").and_then(Value::as_str) {
                        Some("text_delta") => {
                            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                                content.push_str(text);
                                let _ = tx.send(Ok(LlmStreamEvent::TextDelta(text.to_string())));
                            }
                        }
                        Some("thinking_delta") => {
                            if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                                let _ = tx.send(Ok(LlmStreamEvent::ThinkingDelta(text.to_string())));
                            }
                        }
                        Some("input_json_delta") => {
                            if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str) {
                                if let Some(builder) = builders.get_mut(&index) {
                                    builder.append_partial(fragment);
                                    let _ = tx.send(Ok(LlmStreamEvent::ToolCallDelta(ToolCallDelta {
                                        index: index as u32,
                                        tool_call_id: builder.tool_call_id.clone(),
                                        name: builder.name.clone(),
                                        arguments_fragment: Some(fragment.to_string()),
                                    })));
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("content_block_stop") => {
                let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(builder) = builders.remove(&index) {
                    let tool_call = builder.build()?;
                    let _ = tx.send(Ok(LlmStreamEvent::ToolCall(tool_call)));
                }
            }
            Some("message_delta") => {
                if let Some(stop_reason) = event.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str) {
                    finish_reason = Some(stop_reason.to_string());
                }
                if let Some(u) = event.get("usage") {
                    usage = Some(crate::types::LlmUsage {
                        prompt_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
                        completion_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                        total_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0)
                            + u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
                    });
                }
            }
            Some("message_stop") => break,
            _ => {}
        }
    }

    let response = LlmResponse {
        message: turnloop_core::CanonicalMessage::assistant(content, Vec::new()),
        usage,
        finish_reason,
        raw: None,
        fallback_used: false,
    };
    if let Some(trace) = trace {
        let _ = trace.write_response(request_id, &serde_json::to_value(&response).unwrap_or_default()).await;
    }
    let _ = tx.send(Ok(LlmStreamEvent::Completed(response)));
    Ok(())
}

/// Minimal SSE line reader: reassembles `bytes_stream()` chunks into
/// lines and yields the payload of each `data: ...` line.
struct SseLineReader {
    stream: reqwest::Response,
    buffer: String,
}

impl SseLineReader {
    fn new(stream: reqwest::Response) -> Self {
        Self { stream, buffer: String::new() }
    }

    async fn next_data_line(&mut self) -> Result<Option<String>, LlmRequestError> {
        loop {
            if let Some(pos) = self.buffer.find('\n') {
                let line = self.buffer[..pos].trim_end_matches('\r').to_string();
                self.buffer.drain(..=pos);
                if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                    return Ok(Some(data.trim().to_string()));
                }
                continue;
            }
            match self.stream.chunk().await {
                Ok(Some(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(LlmRequestError::new(ErrorCode::NetworkError, e.to_string())),
            }
        }
    }
}
