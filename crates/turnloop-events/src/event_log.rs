//! Append-only per-session event log (spec §3 Event Log Store, §6
//! `events/<session_id>.jsonl`).
//!
//! Grounded on the source's `FileEventLogStore`: one append-only JSONL
//! file per session; `read` supports resuming after a given event id.

use std::path::PathBuf;

use turnloop_core::Event;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub struct EventLogStore {
    root: PathBuf,
}

impl EventLogStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    pub async fn append(&self, event: &Event) -> Result<(), EventLogError> {
        let path = self.path(&event.session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sanitized = turnloop_core::json_sanitize::sanitize_json_value(&serde_json::to_value(event)?);
        let mut line = serde_json::to_vec(&sanitized)?;
        line.push(b'\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Reads every event for `session_id`, optionally skipping everything
    /// up to and including `since_event_id` (cursor-based resumption).
    pub async fn read(&self, session_id: &str, since_event_id: Option<&str>) -> Result<Vec<Event>, EventLogError> {
        let path = self.path(session_id);
        let Ok(contents) = tokio::fs::read_to_string(&path).await else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        let mut seen_anchor = since_event_id.is_none();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Event>(line) else {
                continue;
            };
            if !seen_anchor {
                if Some(event.event_id.as_str()) == since_event_id {
                    seen_anchor = true;
                }
                continue;
            }
            out.push(event);
        }
        Ok(out)
    }
}
