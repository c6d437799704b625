//! Scripted provider for unit tests: canned replies per model name.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

/// Replies are queued per model. The last reply for a model repeats once
/// the queue drains; `None` in a queue means "fail this call".
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    replies: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    pub(crate) requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, model: &str, content: &str) -> Self {
        self.push(model, Some(content.to_string()))
    }

    pub(crate) fn fail(self, model: &str) -> Self {
        self.push(model, None)
    }

    fn push(self, model: &str, reply: Option<String>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub(crate) fn calls_to(&self, model: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.model.as_deref() == Some(model))
            .count()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let model = request.model.clone().unwrap_or_default();
        self.requests.lock().unwrap().push(request);

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.get_mut(&model);
            match queue {
                Some(q) if q.len() > 1 => q.pop_front().flatten(),
                Some(q) => q.front().cloned().flatten(),
                None => None,
            }
        };

        match reply {
            Some(content) => Ok(CompletionResponse {
                content,
                input_tokens: 50,
                output_tokens: 50,
                finish_reason: FinishReason::Stop,
                response_id: None,
            }),
            None => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: format!("no reply scripted for {model}"),
            }),
        }
    }
}
