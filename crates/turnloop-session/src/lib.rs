//! Per-session metadata store (spec §3 `SessionMeta`, §6 `sessions/<id>.json`).
//!
//! Grounded on the source's `FileSessionStore`: one JSON file per session,
//! `updated_at` bumped on every write, listing sorted newest-first.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_core::{fs_write, new_id, now_ts_ms};

/// Open mapping per spec §3: canonical keys are always present, callers
/// may stash additional fields in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub last_request_id: Option<String>,
    #[serde(default)]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub memory_summary: Option<String>,
    #[serde(default)]
    pub last_usage: Option<Value>,
    #[serde(default)]
    pub last_context_stats: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = now_ts_ms();
        Self {
            session_id: session_id.into(),
            created_at: now,
            updated_at: now,
            last_request_id: None,
            last_event_id: None,
            memory_summary: None,
            last_usage: None,
            last_context_stats: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionFilters {
    /// Exact-match filters over top-level keys (including `extra`).
    pub equals: BTreeMap<String, Value>,
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Creates a new session, assigning a `sess_` id if `meta.session_id`
    /// is empty. Returns the final session id.
    pub async fn create_session(&self, mut meta: SessionMeta) -> std::io::Result<String> {
        if meta.session_id.is_empty() {
            meta.session_id = new_id("sess");
        }
        let now = now_ts_ms();
        meta.updated_at = now;
        let path = self.path(&meta.session_id);
        let value = serde_json::to_value(&meta).map_err(std::io::Error::other)?;
        fs_write::write_json_atomic(&path, &value).await?;
        Ok(meta.session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> std::io::Result<SessionMeta> {
        let path = self.path(session_id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("session not found: {session_id}"))
            } else {
                e
            }
        })?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    pub async fn list_sessions(&self, filters: &SessionFilters) -> std::io::Result<Vec<SessionMeta>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(meta) = serde_json::from_slice::<SessionMeta>(&bytes) else { continue };
            if matches_filters(&meta, filters) {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.created_at.cmp(&a.created_at)));
        Ok(out)
    }

    /// Merges `patch` fields into the stored session and bumps `updated_at`.
    pub async fn update_session(&self, session_id: &str, patch: Value) -> std::io::Result<SessionMeta> {
        let mut meta = self.get_session(session_id).await?;
        let mut value = serde_json::to_value(&meta).map_err(std::io::Error::other)?;
        merge_json(&mut value, patch);
        meta = serde_json::from_value(value).map_err(std::io::Error::other)?;
        meta.updated_at = now_ts_ms();
        let path = self.path(session_id);
        let value = serde_json::to_value(&meta).map_err(std::io::Error::other)?;
        fs_write::write_json_atomic(&path, &value).await?;
        Ok(meta)
    }
}

fn matches_filters(meta: &SessionMeta, filters: &SessionFilters) -> bool {
    if filters.equals.is_empty() {
        return true;
    }
    let Ok(value) = serde_json::to_value(meta) else { return false };
    let Value::Object(obj) = value else { return false };
    filters.equals.iter().all(|(k, expected)| obj.get(k) == Some(expected))
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k).or_insert(Value::Null), v);
            }
        }
        (slot, patch_value) => {
            *slot = patch_value;
        }
    }
}
