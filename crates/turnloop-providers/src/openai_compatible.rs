//! OpenAI-compatible wire adapter (spec §4.2).
//!
//! Grounded on `llm/providers/openai_compatible.py` (not read verbatim
//! this session, shape inferred from `client_openai.py`/`types.py`'s
//! canonical contract): chat-completions style request body, system
//! prompt folded into the first `system` message, tool result messages
//! keep `tool_call_id`, tools rendered as `{type:"function", function:{...}}`.

use serde_json::{json, Value};
use turnloop_core::{CanonicalMessageRole, CanonicalRequest, ModelProfile};

use crate::adapter::{reject_reserved_params, AdapterError, PreparedRequest, ProviderAdapter};

pub struct OpenAiCompatibleAdapter;

impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn prepare_request(&self, profile: &ModelProfile, request: &CanonicalRequest) -> Result<PreparedRequest, AdapterError> {
        if !profile.base_url.ends_with("/v1") {
            return Err(AdapterError::InvalidBaseUrl {
                provider_kind: "openai_compatible",
                base_url: profile.base_url.clone(),
                reason: "must end with /v1",
            });
        }
        reject_reserved_params(request)?;

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for message in &request.messages {
            messages.push(render_message(message));
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(profile.model_name));
        body.insert("messages".to_string(), json!(messages));
        if !tools.is_empty() {
            body.insert("tools".to_string(), json!(tools));
        }
        for (key, value) in profile.default_params.iter().chain(request.params.iter()) {
            body.insert(key.clone(), value.clone());
        }

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(credential) = &profile.credential_ref {
            let secret = credential.resolve()?;
            headers.insert("Authorization".to_string(), format!("Bearer {secret}"));
        }

        Ok(PreparedRequest {
            method: "POST".to_string(),
            url: format!("{}/chat/completions", profile.base_url.trim_end_matches('/')),
            headers,
            json: Value::Object(body),
        })
    }
}

fn render_message(message: &turnloop_core::CanonicalMessage) -> Value {
    match message.role {
        CanonicalMessageRole::System => json!({"role": "system", "content": message.content}),
        CanonicalMessageRole::User => json!({"role": "user", "content": message.content}),
        CanonicalMessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        CanonicalMessageRole::Assistant => {
            let mut obj = serde_json::Map::new();
            obj.insert("role".to_string(), json!("assistant"));
            obj.insert("content".to_string(), json!(message.content));
            if let Some(tool_calls) = &message.tool_calls {
                let rendered: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.tool_call_id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.raw_arguments.clone().unwrap_or_else(|| {
                                    serde_json::to_string(&tc.arguments).unwrap_or_default()
                                }),
                            }
                        })
                    })
                    .collect();
                obj.insert("tool_calls".to_string(), json!(rendered));
            }
            Value::Object(obj)
        }
    }
}
