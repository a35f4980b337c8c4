//! Streaming/response types not already covered by `turnloop_core::message`
//! (spec §3, §4.3). Grounded on `llm/types.py`'s `LLMUsage`, `LLMResponse`,
//! `LLMStreamEventKind`, `ToolCallDelta`, `LLMStreamEvent`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_core::{CanonicalMessage, ToolCall};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub message: CanonicalMessage,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub raw: Option<Value>,
    /// Set when this response was produced by the streaming->complete
    /// fallback (spec §4.3); the orchestrator surfaces a progress event
    /// when it sees this flag rather than the client doing so itself.
    #[serde(default)]
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallDelta {
    pub index: u32,
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
    pub arguments_fragment: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LlmStreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    ToolCallDelta(ToolCallDelta),
    ToolCall(ToolCall),
    Completed(LlmResponse),
}

impl LlmStreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LlmStreamEvent::TextDelta(_) => "text_delta",
            LlmStreamEvent::ThinkingDelta(_) => "thinking_delta",
            LlmStreamEvent::ToolCallDelta(_) => "tool_call_delta",
            LlmStreamEvent::ToolCall(_) => "tool_call",
            LlmStreamEvent::Completed(_) => "completed",
        }
    }
}
