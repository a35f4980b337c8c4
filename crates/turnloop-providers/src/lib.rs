pub mod adapter;
pub mod anthropic;
pub mod gemini_internal;
pub mod openai_compatible;
pub mod router;

pub use adapter::{AdapterError, PreparedRequest, ProviderAdapter};
pub use anthropic::AnthropicAdapter;
pub use gemini_internal::GeminiInternalAdapter;
pub use openai_compatible::OpenAiCompatibleAdapter;
pub use router::{ModelRouter, ResolvedModel};

use turnloop_core::ProviderKind;

/// Resolves the concrete adapter for a profile's provider kind.
pub fn adapter_for(provider_kind: ProviderKind) -> Box<dyn ProviderAdapter> {
    match provider_kind {
        ProviderKind::OpenaiCompatible => Box::new(OpenAiCompatibleAdapter),
        ProviderKind::Anthropic => Box::new(AnthropicAdapter),
        ProviderKind::GeminiInternal => Box::new(GeminiInternalAdapter),
    }
}
