//! Model router: one `LlmProvider` facade over several named models.
//!
//! Components ask for a model by name (`CompletionRequest::with_model`).
//! The router picks the registered provider, enforces a per-call timeout,
//! and logs token usage and cost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::costs;
use crate::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};

pub struct ModelRouter {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    default_model: String,
    timeout: Duration,
}

impl ModelRouter {
    /// Router whose fallback target is `default`.
    pub fn new(default: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        let default_model = default.model_name().to_string();
        let mut providers = HashMap::new();
        providers.insert(default_model.clone(), default);
        Self {
            providers,
            default_model,
            timeout,
        }
    }

    /// Register another provider under its own model name.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers
            .insert(provider.model_name().to_string(), provider);
        self
    }

    pub fn models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn resolve(&self, model: Option<&str>) -> Result<&Arc<dyn LlmProvider>, LlmError> {
        let name = model.unwrap_or(&self.default_model);
        self.providers
            .get(name)
            .ok_or_else(|| LlmError::ModelNotAvailable {
                provider: "router".to_string(),
                model: name.to_string(),
            })
    }
}

#[async_trait]
impl LlmProvider for ModelRouter {
    fn model_name(&self) -> &str {
        &self.default_model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        self.providers
            .get(&self.default_model)
            .map(|p| p.cost_per_token())
            .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let provider = Arc::clone(self.resolve(request.model.as_deref())?);
        let model = provider.model_name().to_string();

        let response = match tokio::time::timeout(self.timeout, provider.complete(request)).await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(model = %model, timeout = ?self.timeout, "Model call timed out");
                return Err(LlmError::Timeout {
                    model,
                    timeout: self.timeout,
                });
            }
        };

        let cost = costs::call_cost(
            provider.cost_per_token(),
            response.input_tokens,
            response.output_tokens,
        );
        debug!(
            model = %model,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %cost,
            "Model call complete"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::{ChatMessage, FinishReason};

    struct Named {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl LlmProvider for Named {
        fn model_name(&self) -> &str {
            self.name
        }
        fn cost_per_token(&self) -> (Decimal, Decimal) {
            (Decimal::ZERO, Decimal::ZERO)
        }
        async fn complete(&self, _r: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            tokio::time::sleep(self.delay).await;
            Ok(CompletionResponse {
                content: self.name.to_string(),
                input_tokens: 1,
                output_tokens: 1,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    fn named(name: &'static str) -> Arc<dyn LlmProvider> {
        Arc::new(Named {
            name,
            delay: Duration::ZERO,
        })
    }

    fn req() -> CompletionRequest {
        CompletionRequest::new(vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn dispatches_by_model_name() {
        let router = ModelRouter::new(named("big"), Duration::from_secs(5)).with_provider(named("small"));
        let out = router.complete(req().with_model("small")).await.unwrap();
        assert_eq!(out.content, "small");
        let out = router.complete(req()).await.unwrap();
        assert_eq!(out.content, "big");
        assert_eq!(router.models(), vec!["big", "small"]);
    }

    #[tokio::test]
    async fn unknown_model_is_an_error() {
        let router = ModelRouter::new(named("big"), Duration::from_secs(5));
        let err = router.complete(req().with_model("ghost")).await.unwrap_err();
        assert!(matches!(err, LlmError::ModelNotAvailable { model, .. } if model == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_times_out() {
        let slow: Arc<dyn LlmProvider> = Arc::new(Named {
            name: "slow",
            delay: Duration::from_secs(120),
        });
        let router = ModelRouter::new(slow, Duration::from_secs(1));
        let err = router.complete(req()).await.unwrap_err();
        assert!(matches!(err, LlmError::Timeout { .. }));
    }
}
