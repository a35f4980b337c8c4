//! Config file loading for the hidden project subtree (spec §6:
//! `config/models.json`). `policy/tool_approvals.json` loads the same
//! way but lives in `turnloop-policy` alongside `ToolApprovalConfig`,
//! since this crate carries zero internal dependencies.
//!
//! The teacher keeps a dedicated `qbit-settings` crate for this; per
//! SPEC_FULL.md §B the surface here is small enough (two JSON files) to
//! live as a module of the foundation crate instead.

use std::path::Path;

use crate::model::ModelConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
}

/// Loads `config/models.json` into a `ModelConfig`. Missing file is not
/// an error: callers get an empty config and every `ModelRouter::resolve`
/// call fails with `model_resolution`, which is the documented behavior
/// for an unconfigured role.
pub async fn load_model_config(path: &Path) -> Result<ModelConfig, ConfigLoadError> {
    load_json_or_default(path).await
}

async fn load_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigLoadError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(ConfigLoadError::Read { path: path.display().to_string(), source: e }),
    };
    serde_json::from_slice(&bytes).map_err(|e| ConfigLoadError::Parse { path: path.display().to_string(), source: e })
}
