//! Optional per-request LLM trace directory (SPEC_FULL.md §C.6).
//!
//! Grounded on `llm/trace.py`: when enabled (`TURNLOOP_TRACE_LLM=1`),
//! every `complete()`/`stream()` call writes a directory
//! `{request_id}/{meta,canonical_request,prepared_request,response,error}.json`
//! plus, for streaming calls, `provider_stream.jsonl` (raw SSE chunks) and
//! `canonical_stream.jsonl` (the `LlmStreamEvent`s emitted).

use std::path::PathBuf;

use serde_json::Value;
use turnloop_core::fs_write;

pub const TRACE_ENV_VAR: &str = "TURNLOOP_TRACE_LLM";

pub fn trace_enabled() -> bool {
    std::env::var(TRACE_ENV_VAR).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

#[derive(Clone)]
pub struct TraceSink {
    root: PathBuf,
}

impl TraceSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Builds a sink from the environment, or `None` if tracing is off.
    pub fn from_env(root: PathBuf) -> Option<Self> {
        trace_enabled().then(|| Self::new(root))
    }

    fn request_dir(&self, request_id: &str) -> PathBuf {
        self.root.join(request_id)
    }

    pub async fn write_meta(&self, request_id: &str, meta: &Value) -> std::io::Result<()> {
        fs_write::write_json_atomic(&self.request_dir(request_id).join("meta.json"), meta).await
    }

    pub async fn write_canonical_request(&self, request_id: &str, value: &Value) -> std::io::Result<()> {
        fs_write::write_json_atomic(&self.request_dir(request_id).join("canonical_request.json"), value).await
    }

    pub async fn write_prepared_request(&self, request_id: &str, value: &Value) -> std::io::Result<()> {
        fs_write::write_json_atomic(&self.request_dir(request_id).join("prepared_request.json"), value).await
    }

    pub async fn write_response(&self, request_id: &str, value: &Value) -> std::io::Result<()> {
        fs_write::write_json_atomic(&self.request_dir(request_id).join("response.json"), value).await
    }

    pub async fn write_error(&self, request_id: &str, value: &Value) -> std::io::Result<()> {
        fs_write::write_json_atomic(&self.request_dir(request_id).join("error.json"), value).await
    }

    pub async fn append_provider_stream_line(&self, request_id: &str, line: &Value) -> std::io::Result<()> {
        self.append_jsonl(request_id, "provider_stream.jsonl", line).await
    }

    pub async fn append_canonical_stream_line(&self, request_id: &str, line: &Value) -> std::io::Result<()> {
        self.append_jsonl(request_id, "canonical_stream.jsonl", line).await
    }

    async fn append_jsonl(&self, request_id: &str, filename: &str, line: &Value) -> std::io::Result<()> {
        let dir = self.request_dir(request_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filename);
        let mut text = serde_json::to_string(line).map_err(std::io::Error::other)?;
        text.push('\n');
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_request_dir_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf());
        tokio::fs::create_dir_all(dir.path().join("req_1")).await.unwrap();
        sink.write_meta("req_1", &json!({"provider_kind": "anthropic"})).await.unwrap();
        sink.write_response("req_1", &json!({"ok": true})).await.unwrap();

        let meta = tokio::fs::read(dir.path().join("req_1/meta.json")).await.unwrap();
        let meta: Value = serde_json::from_slice(&meta).unwrap();
        assert_eq!(meta["provider_kind"], "anthropic");
    }

    #[tokio::test]
    async fn appends_jsonl_lines_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path().to_path_buf());
        sink.append_canonical_stream_line("req_2", &json!({"kind": "text_delta"})).await.unwrap();
        sink.append_canonical_stream_line("req_2", &json!({"kind": "completed"})).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("req_2/canonical_stream.jsonl")).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
