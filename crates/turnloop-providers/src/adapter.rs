//! `PreparedRequest` and the `ProviderAdapter` trait (spec §4.2).
//!
//! Grounded on the source's `llm/providers/base.py`: `PreparedRequest` is a
//! plain data bag the LLM client turns into an HTTP call, and
//! `redacted()` exists solely so traces/logs never carry a live secret.

use std::collections::BTreeMap;

use serde_json::Value;
use turnloop_core::{CanonicalRequest, ErrorCode, LlmRequestError, ModelProfile};

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub json: Value,
}

const REDACTED_HEADERS: &[&str] = &["authorization", "x-api-key"];

impl PreparedRequest {
    /// A copy with secret-bearing headers blanked, safe to log or trace
    /// (spec §4.3's `trace` sink records `prepared_request.json`).
    pub fn redacted(&self) -> PreparedRequest {
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| {
                if REDACTED_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                    (k.clone(), "REDACTED".to_string())
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();
        PreparedRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            json: self.json.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid base_url for {provider_kind}: {base_url} ({reason})")]
    InvalidBaseUrl {
        provider_kind: &'static str,
        base_url: String,
        reason: &'static str,
    },
    #[error("reserved param `{0}` may not be set in canonical_request.params")]
    ReservedParam(String),
    #[error(transparent)]
    CredentialResolution(#[from] LlmRequestError),
}

impl AdapterError {
    /// The `ErrorCode` this adapter failure should surface as, so a
    /// missing `env` credential reaches callers as `auth` rather than a
    /// generic `bad_request`.
    pub fn code(&self) -> ErrorCode {
        match self {
            AdapterError::CredentialResolution(e) => e.code,
            AdapterError::InvalidBaseUrl { .. } | AdapterError::ReservedParam(_) => ErrorCode::BadRequest,
        }
    }
}

pub trait ProviderAdapter: Send + Sync {
    fn prepare_request(&self, profile: &ModelProfile, request: &CanonicalRequest) -> Result<PreparedRequest, AdapterError>;
}

/// Reserved transport-layer params no adapter may accept as pass-through
/// (spec §4.2): they're owned by the adapter itself (`model`, `messages`,
/// `stream`, `timeout`) or are provider-specific shape the adapter already
/// derives from `system`/`tools` on the canonical request.
pub(crate) const RESERVED_PARAMS: &[&str] = &["model", "messages", "stream", "timeout", "system", "tools"];

pub(crate) fn reject_reserved_params(request: &CanonicalRequest) -> Result<(), AdapterError> {
    for key in request.params.keys() {
        if RESERVED_PARAMS.contains(&key.as_str()) {
            return Err(AdapterError::ReservedParam(key.clone()));
        }
    }
    Ok(())
}
