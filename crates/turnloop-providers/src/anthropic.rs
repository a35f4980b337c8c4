//! Anthropic wire adapter (spec §4.2).
//!
//! Grounded on `llm/providers/anthropic.py`/`client_anthropic.py` (shape
//! inferred from `types.py`'s canonical contract and
//! `client_tool_calls.py`'s builder, which assumes this exact
//! `tool_use`/`tool_result` content-block shape): system prompt is a
//! top-level field, not a message; a tool-result turn becomes a `user`
//! message with one `tool_result` content block; tools use `input_schema`.

use serde_json::{json, Value};
use turnloop_core::{CanonicalMessageRole, CanonicalRequest, ModelProfile};

use crate::adapter::{reject_reserved_params, AdapterError, PreparedRequest, ProviderAdapter};

pub struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn prepare_request(&self, profile: &ModelProfile, request: &CanonicalRequest) -> Result<PreparedRequest, AdapterError> {
        if profile.base_url.ends_with("/v1") {
            return Err(AdapterError::InvalidBaseUrl {
                provider_kind: "anthropic",
                base_url: profile.base_url.clone(),
                reason: "must not end with /v1",
            });
        }
        reject_reserved_params(request)?;

        let messages: Vec<Value> = request.messages.iter().map(render_message).collect();

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
            .collect();

        let mut body = serde_json::Map::new();
        body.insert("model".to_string(), json!(profile.model_name));
        body.insert("messages".to_string(), json!(messages));
        if let Some(system) = &request.system {
            body.insert("system".to_string(), json!(system));
        }
        if !tools.is_empty() {
            body.insert("tools".to_string(), json!(tools));
        }
        for (key, value) in profile.default_params.iter().chain(request.params.iter()) {
            body.insert(key.clone(), value.clone());
        }
        body.entry("max_tokens").or_insert_with(|| json!(4096));

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        if let Some(credential) = &profile.credential_ref {
            headers.insert("x-api-key".to_string(), credential.resolve()?);
        }

        Ok(PreparedRequest {
            method: "POST".to_string(),
            url: format!("{}/v1/messages", profile.base_url.trim_end_matches('/')),
            headers,
            json: Value::Object(body),
        })
    }
}

fn render_message(message: &turnloop_core::CanonicalMessage) -> Value {
    match message.role {
        CanonicalMessageRole::System => json!({"role": "user", "content": message.content}),
        CanonicalMessageRole::User => json!({"role": "user", "content": message.content}),
        CanonicalMessageRole::Tool => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": message.tool_call_id,
                "content": message.content,
            }],
        }),
        CanonicalMessageRole::Assistant => {
            let mut blocks = Vec::new();
            if !message.content.is_empty() {
                blocks.push(json!({"type": "text", "text": message.content}));
            }
            if let Some(tool_calls) = &message.tool_calls {
                for tc in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.tool_call_id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
            }
            json!({"role": "assistant", "content": blocks})
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use turnloop_core::{CanonicalMessage, ModelCapabilities, ProviderKind};

    fn profile(base_url: &str) -> ModelProfile {
        ModelProfile {
            profile_id: "p1".to_string(),
            provider_kind: ProviderKind::Anthropic,
            base_url: base_url.to_string(),
            model_name: "claude-test".to_string(),
            credential_ref: None,
            timeout_s: None,
            default_params: BTreeMap::new(),
            capabilities: ModelCapabilities::default(),
            tags: Default::default(),
            limits: None,
            context_management: None,
        }
    }

    #[test]
    fn rejects_base_url_ending_in_v1() {
        let adapter = AnthropicAdapter;
        let err = adapter
            .prepare_request(&profile("https://api.anthropic.com/v1"), &CanonicalRequest::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn system_becomes_top_level_field_not_a_message() {
        let adapter = AnthropicAdapter;
        let mut request = CanonicalRequest::default();
        request.system = Some("be terse".to_string());
        request.messages.push(CanonicalMessage::user("hi"));
        let prepared = adapter.prepare_request(&profile("https://api.anthropic.com"), &request).unwrap();
        assert_eq!(prepared.json["system"], "be terse");
        assert_eq!(prepared.json["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn resolves_env_credential_into_x_api_key_header() {
        std::env::set_var("TURNLOOP_TEST_ANTHROPIC_KEY", "sk-ant-test");
        let adapter = AnthropicAdapter;
        let mut p = profile("https://api.anthropic.com");
        p.credential_ref = Some(turnloop_core::CredentialRef::Env { identifier: "TURNLOOP_TEST_ANTHROPIC_KEY".to_string() });
        let prepared = adapter.prepare_request(&p, &CanonicalRequest::default()).unwrap();
        assert_eq!(prepared.headers["x-api-key"], "sk-ant-test");
        std::env::remove_var("TURNLOOP_TEST_ANTHROPIC_KEY");
    }

    #[test]
    fn missing_env_credential_is_an_auth_error() {
        std::env::remove_var("TURNLOOP_TEST_ANTHROPIC_KEY_MISSING");
        let adapter = AnthropicAdapter;
        let mut p = profile("https://api.anthropic.com");
        p.credential_ref =
            Some(turnloop_core::CredentialRef::Env { identifier: "TURNLOOP_TEST_ANTHROPIC_KEY_MISSING".to_string() });
        let err = adapter.prepare_request(&p, &CanonicalRequest::default()).unwrap_err();
        assert_eq!(err.code(), turnloop_core::ErrorCode::Auth);
    }

    #[test]
    fn tool_message_becomes_user_message_with_tool_result_block() {
        let adapter = AnthropicAdapter;
        let mut request = CanonicalRequest::default();
        request.messages.push(CanonicalMessage::tool("42", "toolu_1", "add"));
        let prepared = adapter.prepare_request(&profile("https://api.anthropic.com"), &request).unwrap();
        let messages = prepared.json["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"][0]["type"], "tool_result");
        assert_eq!(messages[0]["content"][0]["tool_use_id"], "toolu_1");
    }
}
