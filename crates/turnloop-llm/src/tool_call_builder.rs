//! Streaming tool-call accumulation (spec §4.3).
//!
//! Grounded on `llm/client_tool_calls.py`'s `_OpenAIToolCallBuilder` (join
//! per-index argument-string fragments, parse once at stream end) and
//! `_AnthropicToolCallBuilder` (accumulate `input_json_delta` chunks,
//! finalize on `content_block_stop`).

use std::collections::BTreeMap;

use turnloop_core::{ErrorCode, LlmRequestError, ToolCall};

fn truncated_snippet(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        raw.to_string()
    } else {
        let snippet: String = raw.chars().take(max).collect();
        format!("{snippet}…")
    }
}

fn parse_arguments_object(raw: &str) -> Result<BTreeMap<String, serde_json::Value>, LlmRequestError> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(LlmRequestError::new(
            ErrorCode::ResponseValidation,
            format!("tool call arguments did not parse to an object: {}", truncated_snippet(raw, 200)),
        )),
        Err(e) => Err(LlmRequestError::new(
            ErrorCode::ResponseValidation,
            format!("failed to parse tool call arguments as JSON: {e} ({})", truncated_snippet(raw, 200)),
        )),
    }
}

#[derive(Debug, Default)]
pub struct OpenAiToolCallBuilder {
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    arguments_parts: Vec<String>,
}

impl OpenAiToolCallBuilder {
    pub fn new(tool_call_id: Option<String>, name: Option<String>) -> Self {
        Self { tool_call_id, name, arguments_parts: Vec::new() }
    }

    pub fn append_arguments(&mut self, fragment: &str) {
        self.arguments_parts.push(fragment.to_string());
    }

    pub fn build(self) -> Result<ToolCall, LlmRequestError> {
        let raw = self.arguments_parts.concat();
        let arguments = parse_arguments_object(&raw)?;
        Ok(ToolCall {
            tool_call_id: self.tool_call_id,
            name: self.name.unwrap_or_default(),
            arguments,
            raw_arguments: Some(raw),
            thought_signature: None,
        })
    }
}

#[derive(Debug, Default)]
pub struct AnthropicToolCallBuilder {
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    partial_json_parts: Vec<String>,
}

impl AnthropicToolCallBuilder {
    pub fn new(tool_call_id: Option<String>, name: Option<String>) -> Self {
        Self { tool_call_id, name, partial_json_parts: Vec::new() }
    }

    pub fn append_partial(&mut self, fragment: &str) {
        self.partial_json_parts.push(fragment.to_string());
    }

    pub fn build(self) -> Result<ToolCall, LlmRequestError> {
        let raw = self.partial_json_parts.concat();
        let arguments = parse_arguments_object(&raw)?;
        Ok(ToolCall {
            tool_call_id: self.tool_call_id,
            name: self.name.unwrap_or_default(),
            arguments,
            raw_arguments: Some(raw),
            thought_signature: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_builder_joins_fragments_then_parses() {
        let mut builder = OpenAiToolCallBuilder::new(Some("call_1".to_string()), Some("add".to_string()));
        builder.append_arguments("{\"a\": 1, ");
        builder.append_arguments("\"b\": 2}");
        let tool_call = builder.build().unwrap();
        assert_eq!(tool_call.name, "add");
        assert_eq!(tool_call.arguments.get("a").unwrap(), &serde_json::json!(1));
    }

    #[test]
    fn openai_builder_errors_on_non_object_result() {
        let mut builder = OpenAiToolCallBuilder::new(None, Some("add".to_string()));
        builder.append_arguments("[1, 2, 3]");
        let err = builder.build().unwrap_err();
        assert_eq!(err.code, ErrorCode::ResponseValidation);
    }

    #[test]
    fn anthropic_builder_empty_input_yields_empty_object() {
        let builder = AnthropicToolCallBuilder::new(Some("toolu_1".to_string()), Some("noop".to_string()));
        let tool_call = builder.build().unwrap();
        assert!(tool_call.arguments.is_empty());
    }

    #[test]
    fn anthropic_builder_accumulates_partial_json_chunks() {
        let mut builder = AnthropicToolCallBuilder::new(Some("toolu_1".to_string()), Some("search".to_string()));
        builder.append_partial("{\"query\": \"");
        builder.append_partial("rust\"}");
        let tool_call = builder.build().unwrap();
        assert_eq!(tool_call.arguments.get("query").unwrap(), "rust");
    }
}
