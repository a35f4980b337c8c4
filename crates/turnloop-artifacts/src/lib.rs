//! Content-addressed blob store for arbitrary bytes (spec §3, §4, §6).
//!
//! Artifacts are write-once: once `put` returns an `ArtifactRef` the bytes
//! at that locator never change. Grounded on the source's
//! `FileArtifactStore` (sha256 digest, `<artifact_id>.bin` locator under
//! `artifacts/`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use turnloop_core::fs_write;
use turnloop_core::{new_id, now_ts_ms, ArtifactRef};

#[derive(Debug, Clone, Default)]
pub struct PutMeta {
    pub summary: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub async fn put(&self, kind: &str, content: &[u8], meta: PutMeta) -> std::io::Result<ArtifactRef> {
        let digest = format!("{:x}", Sha256::digest(content));
        let artifact_id = new_id("art");
        let locator = format!("{artifact_id}.bin");
        let path = self.root.join(&locator);
        fs_write::write_bytes_atomic(&path, content).await?;

        let mut meta_map = meta.extra;
        if let Some(summary) = &meta.summary {
            meta_map.insert("summary".to_string(), Value::String(summary.clone()));
        }

        Ok(ArtifactRef {
            artifact_id,
            artifact_kind: kind.to_string(),
            locator,
            created_at: now_ts_ms(),
            sha256: Some(digest),
            size_bytes: Some(content.len() as u64),
            mime: None,
            summary: meta.summary,
            meta: meta_map,
        })
    }

    pub async fn put_text(&self, kind: &str, text: &str, meta: PutMeta) -> std::io::Result<ArtifactRef> {
        self.put(kind, text.as_bytes(), meta).await
    }

    pub async fn put_json(&self, kind: &str, value: &Value, meta: PutMeta) -> std::io::Result<ArtifactRef> {
        let sanitized = turnloop_core::json_sanitize::sanitize_json_value(value);
        let bytes = serde_json::to_vec(&sanitized).map_err(std::io::Error::other)?;
        self.put(kind, &bytes, meta).await
    }

    pub async fn get(&self, artifact_ref: &ArtifactRef) -> std::io::Result<Vec<u8>> {
        self.open_locator(&artifact_ref.locator).await
    }

    pub async fn open_locator(&self, locator: &str) -> std::io::Result<Vec<u8>> {
        let path = self.resolve_locator(locator);
        tokio::fs::read(path).await
    }

    pub async fn get_text(&self, artifact_ref: &ArtifactRef) -> std::io::Result<String> {
        let bytes = self.get(artifact_ref).await?;
        String::from_utf8(bytes).map_err(std::io::Error::other)
    }

    pub async fn get_json(&self, artifact_ref: &ArtifactRef) -> std::io::Result<Value> {
        let bytes = self.get(artifact_ref).await?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    pub fn resolve_path(&self, artifact_ref: &ArtifactRef) -> PathBuf {
        self.resolve_locator(&artifact_ref.locator)
    }

    fn resolve_locator(&self, locator: &str) -> PathBuf {
        self.root.join(locator)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_exact_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).await.unwrap();
        let reference = store
            .put_text("chat_assistant", "hello world", PutMeta::default())
            .await
            .unwrap();
        assert!(reference.sha256.is_some());
        assert_eq!(reference.size_bytes, Some(11));

        let text = store.get_text(&reference).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn put_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).await.unwrap();
        let value = serde_json::json!({"a": 1, "b": [1,2,3]});
        let reference = store.put_json("canonical_request", &value, PutMeta::default()).await.unwrap();
        let round_tripped = store.get_json(&reference).await.unwrap();
        assert_eq!(round_tripped, value);
    }

    #[tokio::test]
    async fn distinct_puts_get_distinct_locators() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).await.unwrap();
        let a = store.put_text("x", "one", PutMeta::default()).await.unwrap();
        let b = store.put_text("x", "two", PutMeta::default()).await.unwrap();
        assert_ne!(a.locator, b.locator);
        assert_ne!(a.sha256, b.sha256);
    }

    #[tokio::test]
    async fn missing_artifact_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().to_path_buf()).await.unwrap();
        let err = store.open_locator("art_doesnotexist.bin").await;
        assert!(err.is_err());
    }
}
