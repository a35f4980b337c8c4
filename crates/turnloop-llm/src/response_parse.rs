//! Non-streaming response parsing for the three wire shapes (spec §4.3).
//!
//! Grounded on `llm/client_openai.py`/`client_anthropic.py`/
//! `client_gemini_internal.py` response-to-canonical mapping (shape
//! inferred from `types.py`'s `LLMResponse`/`ToolCall` contract); Gemini's
//! `candidates[0].content.parts` interleaving of text and `functionCall`
//! entries is carried verbatim per spec §4.3.

use std::collections::BTreeMap;

use serde_json::Value;
use turnloop_core::{new_id, CanonicalMessage, ErrorCode, LlmRequestError, ToolCall};

use crate::types::{LlmResponse, LlmUsage};

fn truncated(raw: &Value) -> String {
    let s = raw.to_string();
    if s.chars().count() <= 300 {
        s
    } else {
        format!("{}…", s.chars().take(300).collect::<String>())
    }
}

pub fn parse_openai_response(raw: Value) -> Result<LlmResponse, LlmRequestError> {
    let choice = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| LlmRequestError::new(ErrorCode::ResponseValidation, format!("no choices in response: {}", truncated(&raw))))?;
    let message = choice.get("message").ok_or_else(|| {
        LlmRequestError::new(ErrorCode::ResponseValidation, format!("choice missing message: {}", truncated(&raw)))
    })?;
    let content = message.get("content").and_then(Value::as_str).unwrap_or("").to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let function = tc.get("function").cloned().unwrap_or(Value::Null);
                    let raw_arguments = function.get("arguments").and_then(Value::as_str).unwrap_or("{}").to_string();
                    let arguments: BTreeMap<String, Value> =
                        serde_json::from_str(&raw_arguments).unwrap_or_default();
                    ToolCall {
                        tool_call_id: tc.get("id").and_then(Value::as_str).map(String::from),
                        name: function.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        arguments,
                        raw_arguments: Some(raw_arguments),
                        thought_signature: None,
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let finish_reason = choice.get("finish_reason").and_then(Value::as_str).map(String::from);
    let usage = raw.get("usage").map(|u| LlmUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(LlmResponse {
        message: CanonicalMessage::assistant(content, tool_calls),
        usage,
        finish_reason,
        raw: Some(raw),
        fallback_used: false,
    })
}

pub fn parse_anthropic_response(raw: Value) -> Result<LlmResponse, LlmRequestError> {
    let blocks = raw.get("content").and_then(Value::as_array).ok_or_else(|| {
        LlmRequestError::new(ErrorCode::ResponseValidation, format!("response missing content blocks: {}", truncated(&raw)))
    })?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let arguments: BTreeMap<String, Value> = block
                    .get("input")
                    .and_then(Value::as_object)
                    .map(|m| m.clone().into_iter().collect())
                    .unwrap_or_default();
                tool_calls.push(ToolCall {
                    tool_call_id: block.get("id").and_then(Value::as_str).map(String::from),
                    name: block.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                    arguments,
                    raw_arguments: block.get("input").map(|v| v.to_string()),
                    thought_signature: None,
                });
            }
            _ => {}
        }
    }

    let finish_reason = raw.get("stop_reason").and_then(Value::as_str).map(String::from);
    let usage = raw.get("usage").map(|u| LlmUsage {
        prompt_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0)
            + u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(LlmResponse {
        message: CanonicalMessage::assistant(text, tool_calls),
        usage,
        finish_reason,
        raw: Some(raw),
        fallback_used: false,
    })
}

pub fn parse_gemini_response(raw: Value) -> Result<LlmResponse, LlmRequestError> {
    let candidate = raw.get("candidates").and_then(|c| c.get(0)).ok_or_else(|| {
        LlmRequestError::new(ErrorCode::ResponseValidation, format!("no candidates in response: {}", truncated(&raw)))
    })?;
    let parts = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in &parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            let arguments: BTreeMap<String, Value> = call
                .get("args")
                .and_then(Value::as_object)
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default();
            tool_calls.push(ToolCall {
                tool_call_id: Some(new_id("call")),
                name: call.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                arguments,
                raw_arguments: call.get("args").map(|v| v.to_string()),
                thought_signature: part.get("thoughtSignature").and_then(Value::as_str).map(String::from),
            });
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str).map(String::from);
    let usage = raw.get("usageMetadata").map(|u| LlmUsage {
        prompt_tokens: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0),
        completion_tokens: u.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0),
        total_tokens: u.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(0),
    });

    Ok(LlmResponse {
        message: CanonicalMessage::assistant(text, tool_calls),
        usage,
        finish_reason,
        raw: Some(raw),
        fallback_used: false,
    })
}
