//! Auto-compaction: summarize history into the durable memory summary
//! and retain only what fits the post-compaction budget (spec §4.5,
//! §4.6's "decide auto-compact once per turn" step).

use serde_json::json;

use turnloop_core::{EventKind, ModelRequirements};
use turnloop_providers::ResolvedModel;

use crate::{Orchestrator, OrchestratorError};

const COMPACTION_PROMPT: &str =
    "Summarize the conversation so far into a durable memory of decisions made, \
     files touched, and outstanding work. Be concise; this summary replaces the \
     raw history once it is dropped from context.";

impl Orchestrator {
    pub(crate) async fn perform_compaction(
        &mut self,
        request_id: &str,
        turn_id: &str,
        resolved: &ResolvedModel,
    ) -> Result<(), OrchestratorError> {
        let settings = turnloop_context::settings_for_profile(resolved.profile.context_management);
        let context_limit = turnloop_context::resolve_context_limit_tokens(resolved.profile.limits.and_then(|l| l.context_limit_tokens));

        self.emit(EventKind::OperationStarted, json!({"op_kind": "compact"}), Some(request_id), Some(turn_id), None).await?;
        self.emit(
            EventKind::OperationProgress,
            json!({"op_kind": "compact", "note": "summarizing conversation"}),
            Some(request_id),
            Some(turn_id),
            None,
        )
        .await?;

        let request = turnloop_context::build_compaction_request(&self.history, self.memory_summary.as_deref(), COMPACTION_PROMPT, settings.tool_output_budget_tokens);

        match self.llm_client.complete(resolved.role, ModelRequirements::default(), request, None, None).await {
            Ok(response) => {
                let result = turnloop_context::apply_compaction_retention(
                    &self.history,
                    &response.message.content,
                    Some(context_limit),
                    settings.history_budget_ratio,
                    settings.history_budget_fallback_tokens,
                );
                self.memory_summary = Some(result.memory_summary.clone());
                self.history = result.retained_history;
                self.session_store.update_session(&self.session_id, json!({"memory_summary": result.memory_summary})).await?;
                self.emit(
                    EventKind::OperationCompleted,
                    json!({
                        "op_kind": "compact",
                        "history_budget_tokens": result.history_budget_tokens,
                        "summary_estimated_tokens": result.summary_estimated_tokens,
                    }),
                    Some(request_id),
                    Some(turn_id),
                    None,
                )
                .await?;
            }
            Err(err) => {
                self.emit(
                    EventKind::OperationFailed,
                    json!({"op_kind": "compact", "error_code": err.code.as_str(), "error": err.to_string()}),
                    Some(request_id),
                    Some(turn_id),
                    None,
                )
                .await?;
            }
        }

        Ok(())
    }
}
