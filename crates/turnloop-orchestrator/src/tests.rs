use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use turnloop_artifacts::ArtifactStore;
use turnloop_core::{
    ErrorCode, ModelCapabilities, ModelConfig, ModelLimits, ModelProfile, ModelRole, Op, OpKind, ProviderKind,
};
use turnloop_events::{EventBus, EventLogStore};
use turnloop_hitl::ApprovalStore;
use turnloop_llm::LlmClient;
use turnloop_policy::{ApprovalMode, ToolApprovalConfig, ToolPolicyEngine};
use turnloop_providers::ModelRouter;
use turnloop_session::{SessionMeta, SessionStore};
use turnloop_tools::{Tool, ToolError, ToolRegistry, ToolRuntime};

use super::*;

struct ReadFileStub;

#[async_trait::async_trait]
impl Tool for ReadFileStub {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "reads a file"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _args: Value, _project_root: &std::path::Path) -> Result<Value, ToolError> {
        Ok(json!({"content": "hello"}))
    }
}

struct RunCommandStub;

#[async_trait::async_trait]
impl Tool for RunCommandStub {
    fn name(&self) -> &str {
        "run_command"
    }
    fn description(&self) -> &str {
        "runs a shell command"
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _args: Value, _project_root: &std::path::Path) -> Result<Value, ToolError> {
        Ok(json!({"stdout": "ok"}))
    }
}

fn model_config() -> ModelConfig {
    let mut config = ModelConfig::default();
    let profile = ModelProfile {
        profile_id: "main1".to_string(),
        provider_kind: ProviderKind::OpenaiCompatible,
        base_url: "https://api.example.com/v1".to_string(),
        model_name: "test-model".to_string(),
        credential_ref: None,
        timeout_s: None,
        default_params: BTreeMap::new(),
        capabilities: ModelCapabilities::default(),
        tags: Default::default(),
        limits: Some(ModelLimits { context_limit_tokens: Some(32_000), max_output_tokens: None }),
        context_management: None,
    };
    config.role_pointers.insert(ModelRole::Main, profile.profile_id.clone());
    config.profiles.insert(profile.profile_id.clone(), profile);
    config
}

struct Fixture {
    _dir: tempfile::TempDir,
    orchestrator: Orchestrator,
}

async fn build(mode: ApprovalMode, approval_config: ToolApprovalConfig, spec_sealed: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let session_id = "sess_1".to_string();

    let event_log_store = Arc::new(EventLogStore::new(dir.path().join("events")).await.unwrap());
    let event_bus = Arc::new(EventBus::new(Some(event_log_store.clone())));
    let session_store = Arc::new(SessionStore::new(dir.path().join("sessions")).await.unwrap());
    session_store.create_session(SessionMeta::new(session_id.clone())).await.unwrap();
    let artifact_store = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).await.unwrap());
    let approval_store = Arc::new(ApprovalStore::new(dir.path().join("approvals")).await.unwrap());

    let router = Arc::new(ModelRouter::new(model_config()));
    let llm_client = Arc::new(LlmClient::new(router.clone(), None));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileStub)).unwrap();
    registry.register(Arc::new(RunCommandStub)).unwrap();
    let tool_runtime = ToolRuntime::new(registry, artifact_store.clone(), dir.path().to_path_buf());

    let policy_engine = ToolPolicyEngine::new(mode, approval_config);

    let orchestrator = Orchestrator::new(
        dir.path().to_path_buf(),
        session_id,
        event_bus,
        event_log_store,
        session_store,
        artifact_store,
        approval_store,
        llm_client,
        router,
        tool_runtime,
        policy_engine,
        true,
        spec_sealed,
        None,
    );

    Fixture { _dir: dir, orchestrator }
}

fn chat_op(session_id: &str, text: &str) -> Op {
    Op {
        kind: OpKind::Chat,
        request_id: turnloop_core::new_id("req"),
        session_id: session_id.to_string(),
        timestamp: turnloop_core::now_ts_ms(),
        turn_id: Some(turnloop_core::new_id("turn")),
        payload: json!({"text": text}),
        mode: None,
        schema_version: None,
    }
}

fn approval_decision_op(session_id: &str, payload: Value) -> Op {
    Op {
        kind: OpKind::ApprovalDecision,
        request_id: turnloop_core::new_id("req"),
        session_id: session_id.to_string(),
        timestamp: turnloop_core::now_ts_ms(),
        turn_id: None,
        payload,
        mode: None,
        schema_version: None,
    }
}

#[tokio::test]
async fn rejects_empty_chat_text() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();
    fixture.orchestrator.handle(chat_op(&session_id, "   "), None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::OperationFailed
        && e.payload.get("error_code").and_then(Value::as_str) == Some(ErrorCode::BadRequest.as_str())));
}

#[tokio::test]
async fn rejects_op_for_wrong_session() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let err = fixture.orchestrator.handle(chat_op("some-other-session", "hi"), None, None).await;
    assert!(matches!(err, Err(OrchestratorError::SessionMismatch { .. })));
}

#[tokio::test]
async fn rejects_chat_while_an_approval_is_pending() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();

    let record = turnloop_hitl::new_approval_record(
        "appr_pending".to_string(),
        session_id.clone(),
        "req_prev".to_string(),
        "turn_prev".to_string(),
        "run_command(...)".to_string(),
        "high".to_string(),
        None,
        None,
        turnloop_hitl::ResumeKind::ToolChain,
        json!({"tool_calls": []}),
    );
    fixture.orchestrator.approval_store.create(record).await.unwrap();

    fixture.orchestrator.handle(chat_op(&session_id, "hi again"), None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::OperationFailed
        && e.payload.get("error_code").and_then(Value::as_str) == Some(ErrorCode::ApprovalPending.as_str())));
}

#[tokio::test]
async fn chat_with_require_approval_pauses_without_calling_the_llm() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();

    let mut op = chat_op(&session_id, "do something risky");
    op.payload = json!({"text": "do something risky", "require_approval": true, "risk_level": "high"});
    fixture.orchestrator.handle(op, None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::ApprovalRequired));
    assert!(!events.iter().any(|e| e.kind == EventKind::LlmRequestStarted));

    let pending = fixture
        .orchestrator
        .approval_store
        .list(&session_id, Some(turnloop_hitl::ApprovalStatus::Pending), None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].resume_kind, turnloop_hitl::ResumeKind::ChatContinue);
}

#[tokio::test]
async fn tool_loop_allows_low_risk_tool_without_approval() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let planned = fixture
        .orchestrator
        .tool_runtime
        .plan("texec_1".to_string(), "read_file".to_string(), "call_1".to_string(), json!({"path": "a.txt"}))
        .await
        .unwrap();

    let should_continue = fixture
        .orchestrator
        .handle_planned_tool_calls(vec![planned], "req_1", "turn_1", None)
        .await
        .unwrap();
    assert!(should_continue);

    let events = fixture.orchestrator.event_log_store.read(&fixture.orchestrator.session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::ToolCallEnd
        && e.payload.get("status").and_then(Value::as_str) == Some("succeeded")));
    assert!(!events.iter().any(|e| e.kind == EventKind::ApprovalRequired));
}

#[tokio::test]
async fn tool_loop_requires_approval_for_high_risk_tool_and_records_remaining_calls() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let planned = fixture
        .orchestrator
        .tool_runtime
        .plan("texec_1".to_string(), "run_command".to_string(), "call_1".to_string(), json!({"command": "rm -rf /"}))
        .await
        .unwrap();

    let should_continue = fixture
        .orchestrator
        .handle_planned_tool_calls(vec![planned], "req_1", "turn_1", None)
        .await
        .unwrap();
    assert!(!should_continue);

    let session_id = fixture.orchestrator.session_id.clone();
    let pending = fixture
        .orchestrator
        .approval_store
        .list(&session_id, Some(turnloop_hitl::ApprovalStatus::Pending), None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].resume_kind, turnloop_hitl::ResumeKind::ToolChain);
    let resumed_calls = pending[0].resume_payload["tool_calls"].as_array().unwrap();
    assert_eq!(resumed_calls.len(), 1);
}

#[tokio::test]
async fn tool_loop_allows_shell_command_matching_allowlist() {
    let config = ToolApprovalConfig {
        shell_allow: vec![turnloop_policy::ShellAllowEntry { command_prefix: "git status".to_string(), cwd: None }],
        ..Default::default()
    };
    let mut fixture = build(ApprovalMode::Standard, config, false).await;
    let planned = fixture
        .orchestrator
        .tool_runtime
        .plan("texec_1".to_string(), "run_command".to_string(), "call_1".to_string(), json!({"command": "git status"}))
        .await
        .unwrap();

    let should_continue = fixture
        .orchestrator
        .handle_planned_tool_calls(vec![planned], "req_1", "turn_1", None)
        .await
        .unwrap();
    assert!(should_continue);
}

#[tokio::test]
async fn tool_loop_denies_spec_sealed_write() {
    let mut fixture = build(ApprovalMode::Trusted, ToolApprovalConfig::default(), true).await;
    let planned = fixture
        .orchestrator
        .tool_runtime
        .plan("texec_1".to_string(), "write_file".to_string(), "call_1".to_string(), json!({"path": "spec/overview.md", "content": "x"}))
        .await
        .unwrap();

    let should_continue = fixture
        .orchestrator
        .handle_planned_tool_calls(vec![planned], "req_1", "turn_1", None)
        .await
        .unwrap();
    assert!(!should_continue);

    let events = fixture.orchestrator.event_log_store.read(&fixture.orchestrator.session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::ToolCallEnd
        && e.payload.get("status").and_then(Value::as_str) == Some("denied")));
}

#[tokio::test]
async fn approval_decision_rejects_missing_fields() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();
    let op = approval_decision_op(&session_id, json!({}));
    fixture.orchestrator.handle(op, None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::OperationFailed
        && e.payload.get("error_code").and_then(Value::as_str) == Some(ErrorCode::ApprovalDecisionInvalid.as_str())));
}

#[tokio::test]
async fn approval_decision_rejects_unknown_approval_id() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();
    let op = approval_decision_op(&session_id, json!({"approval_id": "nonexistent", "decision": "approve"}));
    fixture.orchestrator.handle(op, None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::OperationFailed
        && e.payload.get("error_code").and_then(Value::as_str) == Some(ErrorCode::ApprovalNotFound.as_str())));
}

#[tokio::test]
async fn approval_decision_deny_on_tool_chain_cancels_and_records_events() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();

    let planned = fixture
        .orchestrator
        .tool_runtime
        .plan("texec_1".to_string(), "run_command".to_string(), "call_1".to_string(), json!({"command": "rm -rf /"}))
        .await
        .unwrap();
    fixture.orchestrator.handle_planned_tool_calls(vec![planned], "req_1", "turn_1", None).await.unwrap();

    let pending = fixture
        .orchestrator
        .approval_store
        .list(&session_id, Some(turnloop_hitl::ApprovalStatus::Pending), None)
        .await
        .unwrap();
    let approval_id = pending[0].approval_id.clone();

    let op = approval_decision_op(&session_id, json!({"approval_id": approval_id, "decision": "deny"}));
    fixture.orchestrator.handle(op, None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::ApprovalDenied));
    assert!(events.iter().any(|e| e.kind == EventKind::ToolCallEnd
        && e.payload.get("status").and_then(Value::as_str) == Some("cancelled")));
    assert!(events.iter().any(|e| e.kind == EventKind::OperationCancelled));

    let resolved = fixture.orchestrator.approval_store.get(&approval_id).await.unwrap();
    assert_eq!(resolved.status, turnloop_hitl::ApprovalStatus::Denied);
}

#[tokio::test]
async fn approval_decision_rejects_redeciding_resolved_approval() {
    let mut fixture = build(ApprovalMode::Standard, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();

    let record = turnloop_hitl::new_approval_record(
        "appr_1".to_string(),
        session_id.clone(),
        "req_prev".to_string(),
        "turn_prev".to_string(),
        "run_command(...)".to_string(),
        "high".to_string(),
        None,
        None,
        turnloop_hitl::ResumeKind::ToolChain,
        json!({"tool_calls": []}),
    );
    fixture.orchestrator.approval_store.create(record).await.unwrap();
    fixture.orchestrator.approval_store.decide("appr_1", turnloop_hitl::ApprovalDecision::Deny).await.unwrap();

    let op = approval_decision_op(&session_id, json!({"approval_id": "appr_1", "decision": "approve"}));
    fixture.orchestrator.handle(op, None, None).await.unwrap();

    let events = fixture.orchestrator.event_log_store.read(&session_id, None).await.unwrap();
    assert!(events.iter().any(|e| e.kind == EventKind::OperationFailed
        && e.payload.get("error_code").and_then(Value::as_str) == Some(ErrorCode::ApprovalNotPending.as_str())));
}

// Uses the approval-gated path to exercise history replay without ever
// reaching the network-calling half of `continue_chat_operation`.
#[tokio::test]
async fn load_history_from_events_replays_the_pending_user_message() {
    let mut fixture = build(ApprovalMode::Trusted, ToolApprovalConfig::default(), false).await;
    let session_id = fixture.orchestrator.session_id.clone();

    let mut op = chat_op(&session_id, "hello there");
    op.payload = json!({"text": "hello there", "require_approval": true, "risk_level": "low"});
    fixture.orchestrator.handle(op, None, None).await.unwrap();
    assert_eq!(fixture.orchestrator.history.len(), 1);

    fixture.orchestrator.load_history_from_events().await.unwrap();
    assert_eq!(fixture.orchestrator.history.len(), 1);
    assert_eq!(fixture.orchestrator.history[0].role, CanonicalMessageRole::User);
    assert_eq!(fixture.orchestrator.history[0].content, "hello there");
}

#[tokio::test]
async fn summarize_text_collapses_whitespace_and_truncates_without_ellipsis() {
    let summarized = summarize_text("  a   b\tc\n\nd  ", 3);
    assert_eq!(summarized, "a ");
    let short = summarize_text("hi there", 100);
    assert_eq!(short, "hi there");
}

#[tokio::test]
async fn redact_canonical_request_omits_full_message_bodies() {
    let request = turnloop_core::CanonicalRequest {
        system: Some("a".repeat(5000)),
        messages: vec![turnloop_core::CanonicalMessage::user("b".repeat(5000))],
        tools: Vec::new(),
        params: Default::default(),
    };
    let redacted = redact_canonical_request(&request);
    let content_preview = redacted["messages"][0]["content_preview"].as_str().unwrap();
    assert!(content_preview.len() < 5000);
    assert!(content_preview.ends_with('…'));
}
