//! Atomic, crash-safe file writes shared by every file-backed store.
//!
//! Spec §5: "Atomicity of writes relies on temp-file-plus-rename." The
//! source's `_safe_write_json` writes to `<path>.tmp` then `Path.replace`,
//! which on POSIX is an atomic rename; we do the same with
//! `tokio::fs::rename`. Unlike the teacher's `approval_recorder.rs`
//! (direct `tokio::fs::write`, no temp file), every store in this
//! workspace goes through this helper.

use std::path::Path;

use crate::json_sanitize::sanitize_json_value;

pub async fn write_json_atomic(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let sanitized = sanitize_json_value(value);
    let body = serde_json::to_vec_pretty(&sanitized).map_err(std::io::Error::other)?;
    write_bytes_atomic(path, &body).await
}

pub async fn write_bytes_atomic(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp").to_string();
    tmp_name.push_str(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
