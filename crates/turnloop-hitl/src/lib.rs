//! Approval records and the approval store (spec §3 `ApprovalRecord`, §4.5,
//! §6 `approvals/<id>.json`).
//!
//! Grounded on the source's `approval.py` (record shape, status parsing)
//! and `stores/fs.py::FileApprovalStore` (create/get/list/update
//! semantics), upgraded to use the shared atomic-write helper the
//! teacher's own `approval_recorder.rs::save()` lacked.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_core::{fs_write, now_ts_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Granted,
    Denied,
}

impl Default for ApprovalStatus {
    fn default() -> Self {
        ApprovalStatus::Pending
    }
}

/// Only the two outcomes spec.md names; parsing an unrecognized decision
/// string fails rather than silently defaulting, since unlike a stored
/// record's status (which must always deserialize to *something*) a
/// decision is supplied fresh by the caller at resume time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeKind {
    ChatContinue,
    ToolChain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub session_id: String,
    pub request_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub status: ApprovalStatus,
    pub turn_id: String,
    pub action_summary: String,
    pub risk_level: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_ref: Option<Value>,
    pub resume_kind: ResumeKind,
    pub resume_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApprovalStoreError {
    #[error("approval already exists: {0}")]
    AlreadyExists(String),
    #[error("approval not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ApprovalStore {
    root: PathBuf,
}

impl ApprovalStore {
    pub async fn new(root: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, approval_id: &str) -> PathBuf {
        self.root.join(format!("{approval_id}.json"))
    }

    pub async fn create(&self, record: ApprovalRecord) -> Result<(), ApprovalStoreError> {
        let path = self.path(&record.approval_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(ApprovalStoreError::AlreadyExists(record.approval_id));
        }
        let value = serde_json::to_value(&record).map_err(std::io::Error::other)?;
        fs_write::write_json_atomic(&path, &value).await?;
        Ok(())
    }

    pub async fn get(&self, approval_id: &str) -> Result<ApprovalRecord, ApprovalStoreError> {
        let path = self.path(approval_id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| ApprovalStoreError::NotFound(approval_id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ApprovalStoreError::Io(std::io::Error::other(e)))
    }

    pub async fn list(
        &self,
        session_id: &str,
        status: Option<ApprovalStatus>,
        request_id: Option<&str>,
    ) -> Result<Vec<ApprovalRecord>, ApprovalStoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else { continue };
            let Ok(record) = serde_json::from_slice::<ApprovalRecord>(&bytes) else { continue };
            if record.session_id != session_id {
                continue;
            }
            if let Some(status) = status {
                if record.status != status {
                    continue;
                }
            }
            if let Some(request_id) = request_id {
                if record.request_id != request_id {
                    continue;
                }
            }
            out.push(record);
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Applies a one-way `pending -> granted|denied` transition, stamping
    /// the decision. Re-deciding an already-resolved approval is rejected.
    pub async fn decide(
        &self,
        approval_id: &str,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRecord, ApprovalStoreError> {
        let mut record = self.get(approval_id).await?;
        if record.status != ApprovalStatus::Pending {
            return Err(ApprovalStoreError::Io(std::io::Error::other(format!(
                "approval {approval_id} is not pending (status={:?})",
                record.status
            ))));
        }
        record.status = match decision {
            ApprovalDecision::Approve => ApprovalStatus::Granted,
            ApprovalDecision::Deny => ApprovalStatus::Denied,
        };
        record.decision = Some(decision);
        let path = self.path(approval_id);
        let value = serde_json::to_value(&record).map_err(std::io::Error::other)?;
        fs_write::write_json_atomic(&path, &value).await?;
        Ok(record)
    }
}

pub fn new_approval_record(
    approval_id: String,
    session_id: String,
    request_id: String,
    turn_id: String,
    action_summary: String,
    risk_level: String,
    reason: Option<String>,
    diff_ref: Option<Value>,
    resume_kind: ResumeKind,
    resume_payload: Value,
) -> ApprovalRecord {
    ApprovalRecord {
        approval_id,
        session_id,
        request_id,
        created_at: now_ts_ms(),
        status: ApprovalStatus::Pending,
        turn_id,
        action_summary,
        risk_level,
        options: vec!["approve".to_string(), "deny".to_string()],
        reason,
        diff_ref,
        resume_kind,
        resume_payload,
        decision: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(approval_id: &str, session_id: &str) -> ApprovalRecord {
        new_approval_record(
            approval_id.to_string(),
            session_id.to_string(),
            "req_1".to_string(),
            "turn_1".to_string(),
            "write_file(path=a.txt)".to_string(),
            "medium".to_string(),
            None,
            None,
            ResumeKind::ToolChain,
            json!({"tool_call_id": "call_1"}),
        )
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path().to_path_buf()).await.unwrap();
        store.create(record("appr_1", "sess_1")).await.unwrap();
        let fetched = store.get("appr_1").await.unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path().to_path_buf()).await.unwrap();
        store.create(record("appr_1", "sess_1")).await.unwrap();
        let err = store.create(record("appr_1", "sess_1")).await;
        assert!(matches!(err, Err(ApprovalStoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn decide_transitions_pending_to_granted_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path().to_path_buf()).await.unwrap();
        store.create(record("appr_1", "sess_1")).await.unwrap();

        let decided = store.decide("appr_1", ApprovalDecision::Approve).await.unwrap();
        assert_eq!(decided.status, ApprovalStatus::Granted);

        let err = store.decide("appr_1", ApprovalDecision::Deny).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_session_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path().to_path_buf()).await.unwrap();
        store.create(record("appr_1", "sess_1")).await.unwrap();
        store.create(record("appr_2", "sess_1")).await.unwrap();
        store.create(record("appr_3", "sess_2")).await.unwrap();
        store.decide("appr_1", ApprovalDecision::Approve).await.unwrap();

        let pending = store.list("sess_1", Some(ApprovalStatus::Pending), None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_id, "appr_2");
    }

    #[tokio::test]
    async fn get_missing_errors_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path().to_path_buf()).await.unwrap();
        let err = store.get("appr_missing").await;
        assert!(matches!(err, Err(ApprovalStoreError::NotFound(_))));
    }
}
