//! Model profiles, roles, and capability resolution (spec §3, §4.2).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{ErrorCode, LlmRequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Anthropic,
    GeminiInternal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Main,
    Write,
    Extract,
    Quick,
    ToolInterpreter,
    Subagent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialRef {
    Env { identifier: String },
    Inline { identifier: String },
}

impl CredentialRef {
    /// Redacts the secret value while keeping enough shape to debug with
    /// (spec §9's source pattern, carried per SPEC_FULL.md §C.4). Never put
    /// this on the wire; it exists for tracing/logging only.
    pub fn to_redacted_string(&self) -> String {
        match self {
            CredentialRef::Env { identifier } => format!("env:{identifier}"),
            CredentialRef::Inline { .. } => "inline:***".to_string(),
        }
    }

    /// Resolves the live secret value (spec §5/§6, grounded on
    /// `runtime/llm/secrets.py::resolve_credential`): `env` reads the
    /// named environment variable and fails with `ErrorCode::Auth` if it
    /// is unset; `inline` returns its value directly.
    pub fn resolve(&self) -> Result<String, LlmRequestError> {
        match self {
            CredentialRef::Env { identifier } => std::env::var(identifier).map_err(|_| {
                LlmRequestError::new(ErrorCode::Auth, format!("environment variable '{identifier}' is not set"))
            }),
            CredentialRef::Inline { identifier } => Ok(identifier.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context_limit_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
}

/// Per-profile overrides for context budgeting; unset fields fall back to
/// the `turnloop-context` crate's defaults (spec §4.5).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextManagementConfig {
    pub auto_compact_threshold_ratio: Option<f64>,
    pub history_budget_ratio: Option<f64>,
    pub history_budget_fallback_tokens: Option<u64>,
    pub tool_output_budget_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub supports_tools: Option<bool>,
    pub supports_structured_output: Option<bool>,
    pub supports_streaming: Option<bool>,
}

impl ModelCapabilities {
    /// Fills unset capability fields with the provider's defaults.
    /// Per SPEC_FULL.md §C.7: gemini_internal defaults to non-streaming
    /// but tool-capable.
    pub fn with_provider_defaults(self, provider_kind: ProviderKind) -> ModelCapabilities {
        let supports_streaming = self.supports_streaming.or(Some(match provider_kind {
            ProviderKind::OpenaiCompatible | ProviderKind::Anthropic => true,
            ProviderKind::GeminiInternal => false,
        }));
        let supports_tools = self.supports_tools.or(Some(true));
        ModelCapabilities {
            supports_tools,
            supports_structured_output: self.supports_structured_output,
            supports_streaming,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelProfile {
    pub profile_id: String,
    pub provider_kind: ProviderKind,
    pub base_url: String,
    pub model_name: String,
    #[serde(default)]
    pub credential_ref: Option<CredentialRef>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub default_params: BTreeMap<String, Value>,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub limits: Option<ModelLimits>,
    #[serde(default)]
    pub context_management: Option<ContextManagementConfig>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelRequirements {
    pub needs_streaming: bool,
    pub needs_tools: bool,
    pub needs_structured_output: bool,
    pub min_context_tokens: Option<u64>,
}

/// `{default_profile?, profiles: {id -> profile}}`, with role pointers
/// assigning each `ModelRole` to exactly one profile id (spec §6
/// `config/models.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub profiles: BTreeMap<String, ModelProfile>,
    #[serde(default)]
    pub role_pointers: BTreeMap<ModelRole, String>,
}
