//! Model router (spec §4.2).
//!
//! Grounded on the source's `llm/router.py::ModelRouter.resolve` and its
//! `_assert_requirements` checks, carried over field-for-field.

use turnloop_core::{ErrorCode, ModelConfig, ModelProfile, ModelRequirements, ModelRole, RuntimeError};

#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub role: ModelRole,
    pub profile: ModelProfile,
    pub requirements: ModelRequirements,
    pub why: String,
}

pub struct ModelRouter {
    config: ModelConfig,
}

impl ModelRouter {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    pub fn resolve(&self, role: ModelRole, requirements: ModelRequirements) -> Result<ResolvedModel, RuntimeError> {
        let profile_id = self.config.role_pointers.get(&role).ok_or_else(|| {
            RuntimeError::typed(ErrorCode::ModelResolution, format!("no model configured for role {role:?}"))
        })?;
        let profile = self.config.profiles.get(profile_id).cloned().ok_or_else(|| {
            RuntimeError::typed(
                ErrorCode::ModelResolution,
                format!("profile not found: {profile_id} (role {role:?})"),
            )
        })?;

        let capabilities = profile.capabilities.with_provider_defaults(profile.provider_kind);

        if requirements.needs_streaming && capabilities.supports_streaming != Some(true) {
            return Err(RuntimeError::typed(
                ErrorCode::ModelResolution,
                format!("profile {profile_id} does not support streaming, required by role {role:?}"),
            ));
        }
        if requirements.needs_tools && capabilities.supports_tools != Some(true) {
            return Err(RuntimeError::typed(
                ErrorCode::ModelResolution,
                format!("profile {profile_id} does not support tools, required by role {role:?}"),
            ));
        }
        if requirements.needs_structured_output && capabilities.supports_structured_output != Some(true) {
            return Err(RuntimeError::typed(
                ErrorCode::ModelResolution,
                format!("profile {profile_id} does not support structured output, required by role {role:?}"),
            ));
        }
        if let Some(min_tokens) = requirements.min_context_tokens {
            let context_limit = profile.limits.and_then(|l| l.context_limit_tokens);
            match context_limit {
                Some(limit) if limit >= min_tokens => {}
                _ => {
                    return Err(RuntimeError::typed(
                        ErrorCode::ModelResolution,
                        format!(
                            "profile {profile_id} context_limit_tokens ({context_limit:?}) below required minimum {min_tokens}"
                        ),
                    ));
                }
            }
        }

        let why = format!("role {role:?} -> profile {profile_id} ({:?})", profile.provider_kind);
        Ok(ResolvedModel { role, profile, requirements, why })
    }
}
