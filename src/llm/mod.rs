//! LLM integration.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! Every pipeline component talks to a `ModelRouter`, which holds one
//! `RigAdapter` per configured model name.

mod costs;
pub mod json;
pub mod provider;
pub mod router;
mod rig_adapter;
#[cfg(test)]
pub(crate) mod scripted;

pub use json::extract_json_object;
pub use provider::*;
pub use rig_adapter::RigAdapter;
pub use router::ModelRouter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{LlmBackend, LlmSettings};
use crate::error::LlmError;

/// Create a single-model provider.
pub fn create_provider(
    backend: LlmBackend,
    api_key: &SecretString,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match backend {
        LlmBackend::Anthropic => create_anthropic_provider(api_key, model),
        LlmBackend::OpenAi => create_openai_provider(api_key, model),
    }
}

fn create_anthropic_provider(
    api_key: &SecretString,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(api_key.expose_secret()).map_err(|e| LlmError::RequestFailed {
            provider: "anthropic".to_string(),
            reason: format!("Failed to create Anthropic client: {}", e),
        })?;

    let completion = client.completion_model(model);
    tracing::debug!(model, "Registered Anthropic model");
    Ok(Arc::new(RigAdapter::new(completion, model)))
}

fn create_openai_provider(
    api_key: &SecretString,
    model: &str,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(api_key.expose_secret()).map_err(|e| LlmError::RequestFailed {
            provider: "openai".to_string(),
            reason: format!("Failed to create OpenAI client: {}", e),
        })?;

    let completion = client.completion_model(model);
    tracing::debug!(model, "Registered OpenAI model");
    Ok(Arc::new(RigAdapter::new(completion, model)))
}

/// Build a router over every model name the pipeline uses. The first name
/// is the default target.
pub fn build_router(settings: &LlmSettings, models: &[&str]) -> Result<ModelRouter, LlmError> {
    let provider_name = match settings.backend {
        LlmBackend::Anthropic => "anthropic",
        LlmBackend::OpenAi => "openai",
    };
    let api_key = settings
        .api_key
        .as_ref()
        .ok_or_else(|| LlmError::AuthFailed {
            provider: provider_name.to_string(),
        })?;
    let (first, rest) = models.split_first().ok_or_else(|| LlmError::ModelNotAvailable {
        provider: provider_name.to_string(),
        model: "(none configured)".to_string(),
    })?;

    let mut router = ModelRouter::new(
        create_provider(settings.backend, api_key, first)?,
        settings.timeout(),
    );
    for model in rest {
        if router.models().contains(model) {
            continue;
        }
        router = router.with_provider(create_provider(settings.backend, api_key, model)?);
    }
    tracing::info!(backend = provider_name, models = ?router.models(), "Model router ready");
    Ok(router)
}
