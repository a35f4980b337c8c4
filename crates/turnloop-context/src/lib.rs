//! Token estimation and history retention for context compaction (spec §4.5).
//!
//! Grounded on `runtime/context_mgmt.py` (approximate token counting,
//! budget selection, recency-based retention) and `runtime/compaction.py`
//! (auto-compact threshold, compaction request assembly, retention
//! application) from the source this crate's behavior was distilled from.

use serde_json::json;
use turnloop_core::{CanonicalMessage, CanonicalMessageRole, CanonicalRequest, ContextManagementConfig};

pub const APPROX_BYTES_PER_TOKEN: usize = 4;
pub const DEFAULT_CONTEXT_LIMIT_TOKENS: u64 = 256_000;
pub const DEFAULT_HISTORY_BUDGET_RATIO: f64 = 0.20;
pub const DEFAULT_HISTORY_BUDGET_FALLBACK_TOKENS: u64 = 8_000;
pub const DEFAULT_TOOL_OUTPUT_BUDGET_TOKENS: u64 = 400;
pub const DEFAULT_AUTO_COMPACT_THRESHOLD_RATIO: f64 = 0.8;

/// Resolves to 256k when the profile doesn't declare one.
pub fn resolve_context_limit_tokens(context_limit_tokens: Option<u64>) -> u64 {
    match context_limit_tokens {
        Some(n) if n > 0 => n,
        _ => DEFAULT_CONTEXT_LIMIT_TOKENS,
    }
}

/// `ceil(utf8_bytes / 4)`.
pub fn approx_tokens_from_text(text: &str) -> u64 {
    let n = text.len() as u64;
    (n + (APPROX_BYTES_PER_TOKEN as u64 - 1)) / APPROX_BYTES_PER_TOKEN as u64
}

pub fn approx_tokens_from_json(value: &serde_json::Value) -> u64 {
    approx_tokens_from_text(&value.to_string())
}

fn message_to_json(msg: &CanonicalMessage) -> serde_json::Value {
    let mut out = json!({"role": role_str(msg.role), "content": msg.content});
    let obj = out.as_object_mut().unwrap();
    if let Some(id) = &msg.tool_call_id {
        obj.insert("tool_call_id".to_string(), json!(id));
    }
    if let Some(name) = &msg.tool_name {
        obj.insert("tool_name".to_string(), json!(name));
    }
    if let Some(calls) = &msg.tool_calls {
        if !calls.is_empty() {
            let rendered: Vec<_> = calls
                .iter()
                .map(|tc| json!({"tool_call_id": tc.tool_call_id, "name": tc.name, "arguments": tc.arguments}))
                .collect();
            obj.insert("tool_calls".to_string(), json!(rendered));
        }
    }
    out
}

fn role_str(role: CanonicalMessageRole) -> &'static str {
    match role {
        CanonicalMessageRole::System => "system",
        CanonicalMessageRole::User => "user",
        CanonicalMessageRole::Assistant => "assistant",
        CanonicalMessageRole::Tool => "tool",
    }
}

pub fn approx_tokens_from_message(msg: &CanonicalMessage) -> u64 {
    approx_tokens_from_json(&message_to_json(msg))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    pub budget_tokens: u64,
    pub source: BudgetSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetSource {
    Ratio,
    Fallback,
}

pub fn history_budget_for_limit(context_limit_tokens: Option<u64>, ratio: f64, fallback_tokens: u64) -> ContextBudget {
    match context_limit_tokens {
        Some(n) if n > 0 => ContextBudget {
            budget_tokens: (n as f64 * ratio) as u64,
            source: BudgetSource::Ratio,
        },
        _ => ContextBudget {
            budget_tokens: fallback_tokens,
            source: BudgetSource::Fallback,
        },
    }
}

pub fn compute_context_left_percent(used_tokens: u64, context_limit_tokens: u64) -> u8 {
    if context_limit_tokens == 0 {
        return 0;
    }
    let left = 1.0 - (used_tokens as f64 / context_limit_tokens as f64);
    let pct = (left * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

pub fn render_context_left_line(used_tokens: Option<u64>, context_limit_tokens: Option<u64>) -> String {
    match (context_limit_tokens, used_tokens) {
        (Some(limit), Some(used)) if limit > 0 => {
            format!("{}% context left", compute_context_left_percent(used, limit))
        }
        (_, Some(used)) => format!("~{used} tokens used"),
        _ => "100% context left".to_string(),
    }
}

/// Truncates to fit `budget_tokens`, keeping a head and tail around an
/// inline marker that reports how many tokens were dropped.
pub fn truncate_text_to_budget(text: &str, budget_tokens: u64) -> String {
    if budget_tokens == 0 {
        return String::new();
    }
    let max_bytes = (budget_tokens as usize) * APPROX_BYTES_PER_TOKEN;
    let raw = text.as_bytes();
    if raw.len() <= max_bytes {
        return text.to_string();
    }
    let head_len = max_bytes / 2;
    let tail_len = max_bytes - head_len;
    let head = lossy_prefix(raw, head_len);
    let tail = lossy_suffix(raw, tail_len);
    let dropped = approx_tokens_from_text(text).saturating_sub(budget_tokens);
    format!("{head}\n…{dropped} tokens truncated…\n{tail}")
}

fn lossy_prefix(raw: &[u8], len: usize) -> String {
    let len = len.min(raw.len());
    let mut end = len;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn lossy_suffix(raw: &[u8], len: usize) -> String {
    let start = raw.len().saturating_sub(len);
    let mut start = start;
    while start < raw.len() && !raw.is_char_boundary(start) {
        start += 1;
    }
    String::from_utf8_lossy(&raw[start..]).into_owned()
}

/// Walks newest-first, keeps whole messages that fit, tail-truncates at
/// most one boundary message if `>= 8` tokens of budget remain, then stops.
pub fn select_recent_messages_to_fit_budget(messages_newest_first: &[CanonicalMessage], budget_tokens: u64) -> Vec<CanonicalMessage> {
    let mut kept = Vec::new();
    let mut remaining = budget_tokens;
    for msg in messages_newest_first {
        if remaining == 0 {
            break;
        }
        let est = approx_tokens_from_message(msg);
        if est <= remaining {
            kept.push(msg.clone());
            remaining -= est;
            continue;
        }
        if remaining >= 8 {
            let mut truncated = msg.clone();
            truncated.content = truncate_text_to_budget(&msg.content, remaining);
            kept.push(truncated);
        }
        break;
    }
    kept
}

pub fn strip_tool_output_for_compaction(msg: &CanonicalMessage, tool_output_budget_tokens: u64) -> CanonicalMessage {
    if msg.role != CanonicalMessageRole::Tool {
        return msg.clone();
    }
    let content = if tool_output_budget_tokens == 0 {
        String::new()
    } else {
        truncate_text_to_budget(&msg.content, tool_output_budget_tokens)
    };
    CanonicalMessage {
        role: msg.role,
        content,
        tool_call_id: msg.tool_call_id.clone(),
        tool_name: msg.tool_name.clone(),
        tool_calls: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextManagementSettings {
    pub auto_compact_threshold_ratio: Option<f64>,
    pub history_budget_ratio: f64,
    pub history_budget_fallback_tokens: u64,
    pub tool_output_budget_tokens: u64,
}

pub fn settings_for_profile(config: Option<ContextManagementConfig>) -> ContextManagementSettings {
    let config = config.unwrap_or_default();
    ContextManagementSettings {
        auto_compact_threshold_ratio: config.auto_compact_threshold_ratio,
        history_budget_ratio: config.history_budget_ratio.unwrap_or(DEFAULT_HISTORY_BUDGET_RATIO),
        history_budget_fallback_tokens: config.history_budget_fallback_tokens.unwrap_or(DEFAULT_HISTORY_BUDGET_FALLBACK_TOKENS),
        tool_output_budget_tokens: config.tool_output_budget_tokens.unwrap_or(DEFAULT_TOOL_OUTPUT_BUDGET_TOKENS),
    }
}

/// A ratio outside `(0, 1)` (including unset) disables auto-compaction.
pub fn is_auto_compact_enabled(ratio: Option<f64>) -> bool {
    matches!(ratio, Some(r) if r > 0.0 && r < 1.0)
}

pub fn should_auto_compact(estimated_input_tokens: u64, context_limit_tokens: Option<u64>, threshold_ratio: Option<f64>) -> bool {
    if !is_auto_compact_enabled(threshold_ratio) {
        return false;
    }
    let Some(limit) = context_limit_tokens.filter(|n| *n > 0) else {
        return false;
    };
    let threshold = threshold_ratio.unwrap() * limit as f64;
    estimated_input_tokens as f64 > threshold
}

/// Builds the summarization request: optional prior summary, the
/// tool-output-stripped history, then the compaction prompt as a final
/// user turn.
pub fn build_compaction_request(history: &[CanonicalMessage], memory_summary: Option<&str>, prompt_text: &str, tool_output_budget_tokens: u64) -> CanonicalRequest {
    let mut messages = Vec::new();
    if let Some(summary) = memory_summary {
        let trimmed = summary.trim();
        if !trimmed.is_empty() {
            messages.push(CanonicalMessage::user(format!("Existing durable session summary (from previous compaction):\n\n{trimmed}")));
        }
    }
    messages.extend(history.iter().map(|m| strip_tool_output_for_compaction(m, tool_output_budget_tokens)));
    messages.push(CanonicalMessage::user(prompt_text));
    CanonicalRequest {
        system: None,
        messages,
        tools: Vec::new(),
        params: Default::default(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub memory_summary: String,
    pub retained_history: Vec<CanonicalMessage>,
    pub history_budget_tokens: u64,
    pub summary_estimated_tokens: u64,
}

/// Trims `memory_summary` to the history budget if it alone overruns it,
/// then fills whatever budget remains with the most recent history.
pub fn apply_compaction_retention(history: &[CanonicalMessage], memory_summary: &str, context_limit_tokens: Option<u64>, history_budget_ratio: f64, history_budget_fallback_tokens: u64) -> CompactionResult {
    let budget = history_budget_for_limit(context_limit_tokens, history_budget_ratio, history_budget_fallback_tokens);
    let memory_summary = if approx_tokens_from_text(memory_summary) > budget.budget_tokens {
        truncate_text_to_budget(memory_summary, budget.budget_tokens)
    } else {
        memory_summary.to_string()
    };
    let summary_tokens = approx_tokens_from_text(&memory_summary);
    let remaining = budget.budget_tokens.saturating_sub(summary_tokens);

    let newest_first: Vec<CanonicalMessage> = history.iter().rev().cloned().collect();
    let kept_newest_first = select_recent_messages_to_fit_budget(&newest_first, remaining);
    let retained: Vec<CanonicalMessage> = kept_newest_first.into_iter().rev().collect();

    CompactionResult {
        memory_summary,
        retained_history: retained,
        history_budget_tokens: budget.budget_tokens,
        summary_estimated_tokens: summary_tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_context_limit_falls_back_to_default() {
        assert_eq!(resolve_context_limit_tokens(None), DEFAULT_CONTEXT_LIMIT_TOKENS);
        assert_eq!(resolve_context_limit_tokens(Some(0)), DEFAULT_CONTEXT_LIMIT_TOKENS);
        assert_eq!(resolve_context_limit_tokens(Some(50_000)), 50_000);
    }

    #[test]
    fn approx_tokens_rounds_up() {
        assert_eq!(approx_tokens_from_text(""), 0);
        assert_eq!(approx_tokens_from_text("a"), 1);
        assert_eq!(approx_tokens_from_text("abcd"), 1);
        assert_eq!(approx_tokens_from_text("abcde"), 2);
    }

    #[test]
    fn auto_compact_disabled_for_out_of_range_ratio() {
        assert!(!is_auto_compact_enabled(None));
        assert!(!is_auto_compact_enabled(Some(0.0)));
        assert!(!is_auto_compact_enabled(Some(1.0)));
        assert!(is_auto_compact_enabled(Some(0.8)));
    }

    #[test]
    fn should_auto_compact_compares_against_threshold() {
        assert!(should_auto_compact(90_000, Some(100_000), Some(0.8)));
        assert!(!should_auto_compact(70_000, Some(100_000), Some(0.8)));
        assert!(!should_auto_compact(90_000, None, Some(0.8)));
    }

    #[test]
    fn truncate_text_to_budget_keeps_head_and_tail_with_marker() {
        let text = "x".repeat(1000);
        let out = truncate_text_to_budget(&text, 10);
        assert!(out.contains("tokens truncated"));
        assert!(out.len() < text.len());
    }

    #[test]
    fn select_recent_messages_stops_after_one_partial_truncation() {
        let messages = vec![CanonicalMessage::user("a".repeat(40)), CanonicalMessage::user("b".repeat(40)), CanonicalMessage::user("c".repeat(40))];
        let newest_first: Vec<_> = messages.into_iter().rev().collect();
        let kept = select_recent_messages_to_fit_budget(&newest_first, 10);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn apply_compaction_retention_fills_remaining_budget_with_recent_history() {
        let history = vec![CanonicalMessage::user("hello"), CanonicalMessage::assistant("hi there", vec![])];
        let result = apply_compaction_retention(&history, "a short summary", Some(100_000), DEFAULT_HISTORY_BUDGET_RATIO, DEFAULT_HISTORY_BUDGET_FALLBACK_TOKENS);
        assert_eq!(result.retained_history.len(), 2);
        assert!(result.history_budget_tokens > 0);
    }

    #[test]
    fn strip_tool_output_only_affects_tool_messages() {
        let user_msg = CanonicalMessage::user("x".repeat(10_000));
        assert_eq!(strip_tool_output_for_compaction(&user_msg, 10).content.len(), 10_000);

        let tool_msg = CanonicalMessage::tool("x".repeat(10_000), "call_1", "echo");
        let stripped = strip_tool_output_for_compaction(&tool_msg, 10);
        assert!(stripped.content.len() < 10_000);
    }
}
