//! Config file loading for `policy/tool_approvals.json` (spec §6). Mirrors
//! `turnloop_core::config::load_model_config`'s contract but lives here
//! since `ToolApprovalConfig` does.

use std::path::Path;

use crate::ToolApprovalConfig;

#[derive(Debug, thiserror::Error)]
pub enum PolicyConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
}

/// Loads `policy/tool_approvals.json`. Missing file is not an error: callers
/// get a `ToolApprovalConfig::default()`, which means no always-approval
/// tools and an empty shell allowlist.
pub async fn load_tool_approval_config(path: &Path) -> Result<ToolApprovalConfig, PolicyConfigLoadError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ToolApprovalConfig::default()),
        Err(e) => return Err(PolicyConfigLoadError::Read { path: path.display().to_string(), source: e }),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| PolicyConfigLoadError::Parse { path: path.display().to_string(), source: e })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_tool_approval_config_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_tool_approval_config(&dir.path().join("policy/tool_approvals.json")).await.unwrap();
        assert!(config.always_require_approval.is_empty());
        assert!(config.shell_allow.is_empty());
    }

    #[tokio::test]
    async fn loads_tool_approval_config_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy/tool_approvals.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &path,
            r#"{"always_require_approval": ["spec_apply"], "shell_allow": [{"command_prefix": "git status"}]}"#,
        )
        .await
        .unwrap();
        let config = load_tool_approval_config(&path).await.unwrap();
        assert!(config.always_require_approval.contains("spec_apply"));
        assert_eq!(config.shell_allow.len(), 1);
    }

    #[tokio::test]
    async fn malformed_tool_approval_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy/tool_approvals.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"not json").await.unwrap();
        let err = load_tool_approval_config(&path).await;
        assert!(matches!(err, Err(PolicyConfigLoadError::Parse { .. })));
    }
}
