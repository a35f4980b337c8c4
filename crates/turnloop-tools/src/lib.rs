//! Tool registry, planning, and execution (spec §4.4).
//!
//! Grounded on `qbit-core::tool::Tool` for the trait shape (`name`,
//! `description`, `parameters`, async `execute(args, workspace)`), and on
//! `qbit-tools::ToolRegistry` for the unique-name-enforced registry /
//! `execute_tool` contract. Concrete tool implementations (file ops,
//! shell exec, web fetch, …) are out of scope per spec.md's
//! "black box" tool bodies; only the runtime around them lives here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnloop_artifacts::{ArtifactStore, PutMeta};
use turnloop_core::{ArtifactRef, ErrorCode, ToolSpec};

#[derive(Debug, Clone)]
pub enum ToolError {
    Permission(String),
    NotFound(String),
    Timeout(String),
    BadRequest(String),
    Failed(String),
}

impl ToolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ToolError::Permission(_) => ErrorCode::Permission,
            ToolError::NotFound(_) => ErrorCode::NotFound,
            ToolError::Timeout(_) => ErrorCode::Timeout,
            ToolError::BadRequest(_) => ErrorCode::BadRequest,
            ToolError::Failed(_) => ErrorCode::ToolFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ToolError::Permission(m) | ToolError::NotFound(m) | ToolError::Timeout(m) | ToolError::BadRequest(m) | ToolError::Failed(m) => m,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ToolError {}

/// A registered tool: `{name, description, input_schema, execute}`
/// (spec §4.4). Implementations are the out-of-scope black boxes.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, args: Value, project_root: &Path) -> Result<Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateName(String),
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedToolCall {
    pub tool_execution_id: String,
    pub tool_name: String,
    pub tool_call_id: String,
    pub arguments: Value,
    pub arguments_ref: ArtifactRef,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("tool_execution_id must not be empty")]
    MissingExecutionId,
    #[error("tool_name must not be empty")]
    MissingToolName,
    #[error("tool_call_id must not be empty")]
    MissingToolCallId,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_execution_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<ArtifactRef>,
    pub tool_message_ref: ArtifactRef,
    /// The same envelope `tool_message_ref` points to, inlined so callers
    /// don't have to round-trip through the artifact store on the hot
    /// turn-loop path.
    pub tool_message_content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub duration_ms: u64,
}

/// Recursively rebuilds `value` with object keys in sorted order, so the
/// serialized bytes are stable regardless of the `Value`'s internal map
/// implementation (spec §4.4: "serializes arguments canonically").
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

pub struct ToolRuntime {
    registry: ToolRegistry,
    artifacts: Arc<ArtifactStore>,
    project_root: PathBuf,
}

impl ToolRuntime {
    pub fn new(registry: ToolRegistry, artifacts: Arc<ArtifactStore>, project_root: PathBuf) -> Self {
        Self { registry, artifacts, project_root }
    }

    pub fn names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Tool specs for every registered tool, in the shape a
    /// `CanonicalRequest` carries them in.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        self.registry
            .names()
            .into_iter()
            .filter_map(|name| self.registry.get(&name))
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub async fn plan(
        &self,
        tool_execution_id: String,
        tool_name: String,
        tool_call_id: String,
        arguments: Value,
    ) -> Result<PlannedToolCall, PlanError> {
        if tool_execution_id.is_empty() {
            return Err(PlanError::MissingExecutionId);
        }
        if tool_name.is_empty() {
            return Err(PlanError::MissingToolName);
        }
        if tool_call_id.is_empty() {
            return Err(PlanError::MissingToolCallId);
        }
        let canonical_arguments = canonicalize(&arguments);
        let arguments_ref = self
            .artifacts
            .put_json("tool_call_arguments", &canonical_arguments, PutMeta { summary: Some(tool_name.clone()), ..Default::default() })
            .await?;
        Ok(PlannedToolCall {
            tool_execution_id,
            tool_name,
            tool_call_id,
            arguments: canonical_arguments,
            arguments_ref,
        })
    }

    pub async fn execute(&self, planned: &PlannedToolCall) -> Result<ToolExecutionResult, std::io::Error> {
        let started = Instant::now();

        let outcome = match self.registry.get(&planned.tool_name) {
            None => Err(ToolError::NotFound(format!("unknown tool: {}", planned.tool_name))),
            Some(tool) => tool.execute(planned.arguments.clone(), &self.project_root).await,
        };

        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                let output_ref = self
                    .artifacts
                    .put_json("tool_output", &output, PutMeta { summary: Some(planned.tool_name.clone()), ..Default::default() })
                    .await?;
                let envelope = serde_json::json!({
                    "ok": true,
                    "tool": planned.tool_name,
                    "output_ref": output_ref,
                    "result": output,
                });
                let tool_message_ref = self
                    .artifacts
                    .put_json("tool_message", &envelope, PutMeta { summary: Some(planned.tool_name.clone()), ..Default::default() })
                    .await?;
                Ok(ToolExecutionResult {
                    tool_execution_id: planned.tool_execution_id.clone(),
                    ok: true,
                    output_ref: Some(output_ref),
                    tool_message_ref,
                    tool_message_content: envelope,
                    error_code: None,
                    duration_ms,
                })
            }
            Err(err) => {
                let error_code = if self.registry.get(&planned.tool_name).is_none() {
                    ErrorCode::ToolUnknown
                } else {
                    err.code()
                };
                let envelope = serde_json::json!({
                    "ok": false,
                    "tool": planned.tool_name,
                    "output_ref": Value::Null,
                    "result": {"error": err.message(), "error_code": error_code},
                });
                let tool_message_ref = self
                    .artifacts
                    .put_json("tool_message", &envelope, PutMeta { summary: Some(planned.tool_name.clone()), ..Default::default() })
                    .await?;
                Ok(ToolExecutionResult {
                    tool_execution_id: planned.tool_execution_id.clone(),
                    ok: false,
                    output_ref: None,
                    tool_message_ref,
                    tool_message_content: envelope,
                    error_code: Some(error_code),
                    duration_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value, _project_root: &Path) -> Result<Value, ToolError> {
            Ok(args)
        }
    }

    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _project_root: &Path) -> Result<Value, ToolError> {
            Err(ToolError::BadRequest("bad input".to_string()))
        }
    }

    async fn runtime() -> (tempfile::TempDir, ToolRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")).await.unwrap());
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry.register(Arc::new(FailingTool)).unwrap();
        let runtime = ToolRuntime::new(registry, artifacts, dir.path().to_path_buf());
        (dir, runtime)
    }

    #[test]
    fn canonicalize_sorts_object_keys() {
        let value = json!({"b": 1, "a": 2});
        let canonical = canonicalize(&value);
        let keys: Vec<&String> = canonical.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn registering_duplicate_name_errors() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool));
        assert!(matches!(err, Err(RegistryError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn plan_rejects_missing_ids() {
        let (_dir, runtime) = runtime().await;
        let err = runtime.plan("".to_string(), "echo".to_string(), "call_1".to_string(), json!({})).await;
        assert!(matches!(err, Err(PlanError::MissingExecutionId)));
    }

    #[tokio::test]
    async fn execute_success_stores_output_and_message_refs() {
        let (_dir, runtime) = runtime().await;
        let planned = runtime
            .plan("exec_1".to_string(), "echo".to_string(), "call_1".to_string(), json!({"x": 1}))
            .await
            .unwrap();
        let result = runtime.execute(&planned).await.unwrap();
        assert!(result.ok);
        assert!(result.output_ref.is_some());
        assert_eq!(result.tool_message_content["ok"], true);
    }

    #[tokio::test]
    async fn execute_failure_maps_tool_error_to_error_code() {
        let (_dir, runtime) = runtime().await;
        let planned = runtime
            .plan("exec_2".to_string(), "fail".to_string(), "call_2".to_string(), json!({}))
            .await
            .unwrap();
        let result = runtime.execute(&planned).await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error_code, Some(ErrorCode::BadRequest));
    }

    #[tokio::test]
    async fn execute_unknown_tool_yields_tool_unknown() {
        let (_dir, runtime) = runtime().await;
        let planned = runtime
            .plan("exec_3".to_string(), "mystery".to_string(), "call_3".to_string(), json!({}))
            .await
            .unwrap();
        let result = runtime.execute(&planned).await.unwrap();
        assert_eq!(result.error_code, Some(ErrorCode::ToolUnknown));
    }
}
