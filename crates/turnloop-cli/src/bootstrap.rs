//! CLI bootstrap: lay out the hidden `.turnloop/` project subtree (spec
//! §6), load its config, and build every store the orchestrator needs.
//!
//! Grounded on the teacher's `cli/bootstrap.rs::initialize` (one function
//! building a single context struct), scaled down to this runtime's much
//! smaller store set: no GUI/indexer/sidecar/MCP machinery, since spec.md
//! scopes the CLI front-end and concrete tool implementations out.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use turnloop_artifacts::ArtifactStore;
use turnloop_core::ModelConfig;
use turnloop_events::{EventBus, EventLogStore};
use turnloop_hitl::ApprovalStore;
use turnloop_llm::{LlmClient, TraceSink};
use turnloop_orchestrator::Orchestrator;
use turnloop_policy::{ToolApprovalConfig, ToolPolicyEngine};
use turnloop_providers::ModelRouter;
use turnloop_session::{SessionMeta, SessionStore};
use turnloop_tools::{ToolRegistry, ToolRuntime};

use crate::args::Args;

const STATE_DIR_NAME: &str = ".turnloop";

/// Every initialized service the CLI's `main` loop touches.
pub struct CliContext {
    pub orchestrator: Orchestrator,
    pub event_bus: Arc<EventBus>,
}

fn state_dir(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR_NAME)
}

/// Builds the full stack for `args.workspace`, creating or resuming a
/// session as `args.session` directs.
pub async fn initialize(args: &Args) -> anyhow::Result<CliContext> {
    let workspace = args.resolve_workspace()?;
    let state = state_dir(&workspace);

    let model_config: ModelConfig = turnloop_core::config::load_model_config(&state.join("config/models.json"))
        .await
        .context("failed to load config/models.json")?;
    let approval_config: ToolApprovalConfig =
        turnloop_policy::load_tool_approval_config(&state.join("policy/tool_approvals.json"))
            .await
            .context("failed to load policy/tool_approvals.json")?;

    let event_log_store = Arc::new(
        EventLogStore::new(state.join("events"))
            .await
            .context("failed to open events/ store")?,
    );
    let event_bus = Arc::new(EventBus::new(Some(event_log_store.clone())));
    let session_store = Arc::new(
        SessionStore::new(state.join("sessions")).await.context("failed to open sessions/ store")?,
    );
    let artifact_store = Arc::new(
        ArtifactStore::new(state.join("artifacts")).await.context("failed to open artifacts/ store")?,
    );
    let approval_store = Arc::new(
        ApprovalStore::new(state.join("state/approvals")).await.context("failed to open state/approvals/ store")?,
    );

    let model_router = Arc::new(ModelRouter::new(model_config));
    let trace = TraceSink::from_env(state.join("cache/llm_trace"));
    let llm_client = Arc::new(LlmClient::new(model_router.clone(), trace));

    // Concrete tool implementations are out of scope (spec.md's "black
    // box" tool bodies); the registry is intentionally empty here. A host
    // embedding this binary would register real tools before `run`.
    let tool_runtime = ToolRuntime::new(ToolRegistry::new(), artifact_store.clone(), workspace.clone());
    let policy_engine = ToolPolicyEngine::new(args.approval_mode.into(), approval_config);

    let session_id = match &args.session {
        Some(id) => id.clone(),
        None => session_store.create_session(SessionMeta::new("")).await.context("failed to create session")?,
    };

    let orchestrator = Orchestrator::for_session(
        workspace,
        session_id,
        event_bus.clone(),
        event_log_store,
        session_store,
        artifact_store,
        approval_store,
        llm_client,
        model_router,
        tool_runtime,
        policy_engine,
        false,
        args.spec_sealed,
        None,
    )
    .await
    .context("failed to build orchestrator for session")?;

    Ok(CliContext { orchestrator, event_bus })
}
