//! Foundation types for the turnloop agent runtime.
//!
//! Zero internal dependencies; every other crate in the workspace depends
//! on this one. Holds identifiers, the event/op schema, artifact
//! references, canonical messages, model profiles, and the shared error
//! taxonomy.

pub mod artifact;
pub mod config;
pub mod errors;
pub mod event;
pub mod fs_write;
pub mod ids;
pub mod json_sanitize;
pub mod message;
pub mod model;

pub use artifact::ArtifactRef;
pub use config::ConfigLoadError;
pub use errors::{ErrorCode, LlmRequestError, RuntimeError};
pub use event::{Event, EventKind, Op, OpKind};
pub use ids::{new_id, now_ts_ms};
pub use message::{CanonicalMessage, CanonicalMessageRole, CanonicalRequest, ToolCall, ToolSpec};
pub use model::{
    ContextManagementConfig, CredentialRef, ModelCapabilities, ModelConfig, ModelLimits,
    ModelProfile, ModelRequirements, ModelRole, ProviderKind,
};
