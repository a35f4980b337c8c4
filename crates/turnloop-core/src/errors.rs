//! Shared error taxonomy used by events and typed errors alike (spec §7).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, cross-module error codes. Values are the wire strings used in
/// event payloads (`error_code`) as well as in `RuntimeError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Cancelled,
    Timeout,
    Auth,
    Permission,
    RateLimit,
    BadRequest,
    NotFound,
    Conflict,
    Unprocessable,
    ServerError,
    NetworkError,
    ResponseValidation,
    Unknown,

    ModelResolution,
    ApprovalPending,
    ApprovalDecisionInvalid,
    ApprovalNotFound,
    ApprovalSessionMismatch,
    ApprovalNotPending,
    ApprovalResumeInvalid,

    ToolCallsDisabled,
    ToolCallPlanFailed,
    ToolUnknown,
    ToolDenied,
    ToolFailed,
    ToolLoopLimit,

    EventLogAppendFailed,
}

impl ErrorCode {
    /// Codes that the LLM client's `complete()` boundary will retry once.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::RateLimit
                | ErrorCode::ServerError
                | ErrorCode::NetworkError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Auth => "auth",
            ErrorCode::Permission => "permission",
            ErrorCode::RateLimit => "rate_limit",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Unprocessable => "unprocessable",
            ErrorCode::ServerError => "server_error",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::ResponseValidation => "response_validation",
            ErrorCode::Unknown => "unknown",
            ErrorCode::ModelResolution => "model_resolution",
            ErrorCode::ApprovalPending => "approval_pending",
            ErrorCode::ApprovalDecisionInvalid => "approval_decision_invalid",
            ErrorCode::ApprovalNotFound => "approval_not_found",
            ErrorCode::ApprovalSessionMismatch => "approval_session_mismatch",
            ErrorCode::ApprovalNotPending => "approval_not_pending",
            ErrorCode::ApprovalResumeInvalid => "approval_resume_invalid",
            ErrorCode::ToolCallsDisabled => "tool_calls_disabled",
            ErrorCode::ToolCallPlanFailed => "tool_call_plan_failed",
            ErrorCode::ToolUnknown => "tool_unknown",
            ErrorCode::ToolDenied => "tool_denied",
            ErrorCode::ToolFailed => "tool_failed",
            ErrorCode::ToolLoopLimit => "tool_loop_limit",
            ErrorCode::EventLogAppendFailed => "event_log_append_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{code, provider_kind, profile_id, model, status_code, request_id, retryable, details, cause}`
/// from spec §4.3/§7, the shape every provider/LLM-layer failure is wrapped into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequestError {
    pub code: ErrorCode,
    pub provider_kind: Option<String>,
    pub profile_id: Option<String>,
    pub model: Option<String>,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    pub retryable: bool,
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl LlmRequestError {
    pub fn new(code: ErrorCode, details: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self {
            code,
            provider_kind: None,
            profile_id: None,
            model: None,
            status_code: None,
            request_id: None,
            retryable,
            details: Some(details.into()),
            cause: None,
        }
    }

    pub fn with_profile(mut self, provider_kind: impl Into<String>, profile_id: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider_kind = Some(provider_kind.into());
        self.profile_id = Some(profile_id.into());
        self.model = Some(model.into());
        self
    }
}

impl fmt::Display for LlmRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.details.as_deref().unwrap_or(""))
    }
}

impl std::error::Error for LlmRequestError {}

/// Top-level runtime error, used wherever a component needs to surface a
/// typed failure that callers match on `.code()`.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Llm(#[from] LlmRequestError),

    #[error("{code}: {message}")]
    Typed { code: ErrorCode, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn typed(code: ErrorCode, message: impl Into<String>) -> Self {
        RuntimeError::Typed {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::Llm(e) => e.code,
            RuntimeError::Typed { code, .. } => *code,
            RuntimeError::Io(_) => ErrorCode::Unknown,
            RuntimeError::Json(_) => ErrorCode::BadRequest,
            RuntimeError::Other(_) => ErrorCode::Unknown,
        }
    }
}
