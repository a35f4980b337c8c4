//! Gemini-internal wire adapter (spec §4.2).
//!
//! Grounded on `llm/providers/gemini_internal.py`/`client_gemini_internal.py`
//! (shape inferred from `types.py`): messages flatten to Gemini's
//! `contents` shape with roles `user`/`model`, tool responses become
//! `functionResponse` parts, and the whole payload wraps under
//! `{model, project, request:{...}}` to match the internal RPC surface
//! rather than the public Gemini REST API.

use serde_json::{json, Value};
use turnloop_core::{CanonicalMessageRole, CanonicalRequest, ModelProfile};

use crate::adapter::{reject_reserved_params, AdapterError, PreparedRequest, ProviderAdapter};

pub struct GeminiInternalAdapter;

impl ProviderAdapter for GeminiInternalAdapter {
    fn prepare_request(&self, profile: &ModelProfile, request: &CanonicalRequest) -> Result<PreparedRequest, AdapterError> {
        if profile.base_url.ends_with("/v1") {
            return Err(AdapterError::InvalidBaseUrl {
                provider_kind: "gemini_internal",
                base_url: profile.base_url.clone(),
                reason: "must not end with /v1",
            });
        }
        reject_reserved_params(request)?;

        let mut contents = Vec::new();
        if let Some(system) = &request.system {
            contents.push(json!({"role": "user", "parts": [{"text": system}]}));
        }
        for message in &request.messages {
            contents.push(render_message(message));
        }

        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "functionDeclarations": [{
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }]
                })
            })
            .collect();

        let mut inner = serde_json::Map::new();
        inner.insert("contents".to_string(), json!(contents));
        if !tools.is_empty() {
            inner.insert("tools".to_string(), json!(tools));
            inner.insert("toolConfig".to_string(), json!({"functionCallingConfig": {"mode": "AUTO"}}));
        }
        for (key, value) in profile.default_params.iter().chain(request.params.iter()) {
            inner.insert(key.clone(), value.clone());
        }

        let project = profile
            .tags
            .iter()
            .find_map(|t| t.strip_prefix("project:"))
            .unwrap_or("default")
            .to_string();

        let body = json!({
            "model": profile.model_name,
            "project": project,
            "request": inner,
        });

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        if let Some(credential) = &profile.credential_ref {
            let secret = credential.resolve()?;
            headers.insert("Authorization".to_string(), format!("Bearer {secret}"));
        }

        Ok(PreparedRequest {
            method: "POST".to_string(),
            url: format!("{}/generateContent", profile.base_url.trim_end_matches('/')),
            headers,
            json: body,
        })
    }
}

fn render_message(message: &turnloop_core::CanonicalMessage) -> Value {
    match message.role {
        CanonicalMessageRole::System | CanonicalMessageRole::User => {
            json!({"role": "user", "parts": [{"text": message.content}]})
        }
        CanonicalMessageRole::Tool => json!({
            "role": "user",
            "parts": [{
                "functionResponse": {
                    "name": message.tool_name,
                    "response": {"content": message.content},
                }
            }],
        }),
        CanonicalMessageRole::Assistant => {
            let mut parts = Vec::new();
            if !message.content.is_empty() {
                parts.push(json!({"text": message.content}));
            }
            if let Some(tool_calls) = &message.tool_calls {
                for tc in tool_calls {
                    parts.push(json!({
                        "functionCall": {"name": tc.name, "args": tc.arguments},
                    }));
                }
            }
            json!({"role": "model", "parts": parts})
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
            provider_kind: ProviderKind::GeminiInternal,
            base_url: base_url.to_string(),
            model_name: "gemini-test".to_string(),
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
        let adapter = GeminiInternalAdapter;
        let err = adapter
            .prepare_request(&profile("https://internal.example.com/v1"), &CanonicalRequest::default())
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn wraps_payload_under_model_project_request() {
        let adapter = GeminiInternalAdapter;
        let mut request = CanonicalRequest::default();
        request.messages.push(CanonicalMessage::user("hi"));
        let prepared = adapter.prepare_request(&profile("https://internal.example.com"), &request).unwrap();
        assert_eq!(prepared.json["model"], "gemini-test");
        assert!(prepared.json["request"]["contents"].is_array());
    }

    #[test]
    fn resolves_env_credential_into_bearer_header() {
        std::env::set_var("TURNLOOP_TEST_GEMINI_KEY", "gemini-test-token");
        let adapter = GeminiInternalAdapter;
        let mut p = profile("https://internal.example.com");
        p.credential_ref = Some(turnloop_core::CredentialRef::Env { identifier: "TURNLOOP_TEST_GEMINI_KEY".to_string() });
        let prepared = adapter.prepare_request(&p, &CanonicalRequest::default()).unwrap();
        assert_eq!(prepared.headers["Authorization"], "Bearer gemini-test-token");
        std::env::remove_var("TURNLOOP_TEST_GEMINI_KEY");
    }

    #[test]
    fn missing_env_credential_is_an_auth_error() {
        std::env::remove_var("TURNLOOP_TEST_GEMINI_KEY_MISSING");
        let adapter = GeminiInternalAdapter;
        let mut p = profile("https://internal.example.com");
        p.credential_ref =
            Some(turnloop_core::CredentialRef::Env { identifier: "TURNLOOP_TEST_GEMINI_KEY_MISSING".to_string() });
        let err = adapter.prepare_request(&p, &CanonicalRequest::default()).unwrap_err();
        assert_eq!(err.code(), turnloop_core::ErrorCode::Auth);
    }

    #[test]
    fn assistant_role_renders_as_model_not_assistant() {
        let adapter = GeminiInternalAdapter;
        let mut request = CanonicalRequest::default();
        request.messages.push(CanonicalMessage::assistant("ok", vec![]));
        let prepared = adapter.prepare_request(&profile("https://internal.example.com"), &request).unwrap();
        let contents = prepared.json["request"]["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "model");
    }

    #[test]
    fn tool_message_becomes_function_response_part() {
        let adapter = GeminiInternalAdapter;
        let mut request = CanonicalRequest::default();
        request.messages.push(CanonicalMessage::tool("42", "call_1", "add"));
        let prepared = adapter.prepare_request(&profile("https://internal.example.com"), &request).unwrap();
        let contents = prepared.json["request"]["contents"].as_array().unwrap();
        assert_eq!(contents[0]["parts"][0]["functionResponse"]["name"], "add");
    }
}
