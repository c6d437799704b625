//! Writer model: personalizes a vetted template for one inbound message.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, ValidationError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::store::StoredMessage;

const WRITER_TEMPERATURE: f32 = 0.7;

const WRITER_MAX_TOKENS: u32 = 1000;

/// Inbound body characters shown to the writer and reviewer.
pub const BODY_PREVIEW_CHARS: usize = 500;

/// What the writer and reviewer know about the inbound message.
#[derive(Debug, Clone)]
pub struct DraftContext {
    pub from_name: Option<String>,
    pub from_email: String,
    pub subject: String,
    pub body_preview: String,
    pub score: Option<i64>,
    pub bucket: String,
}

impl DraftContext {
    pub fn from_message(msg: &StoredMessage, bucket: &str) -> Self {
        Self {
            from_name: msg.from_name.clone(),
            from_email: msg.from_email.clone(),
            subject: msg.subject.clone(),
            body_preview: msg.body_text.chars().take(BODY_PREVIEW_CHARS).collect(),
            score: msg.score,
            bucket: bucket.to_string(),
        }
    }
}

fn build_writer_prompt(template: &str, ctx: &DraftContext) -> String {
    format!(
        "You are personalizing a reply template for a business email.\n\n\
         TEMPLATE:\n{template}\n\n\
         CONTEXT:\n\
         From: {} ({})\n\
         Subject: {}\n\
         Their message: {}\n\
         Score: {} ({})\n\n\
         RULES:\n\
         - Keep the template's structure and intent\n\
         - Personalize the greeting and any references to their specific situation\n\
         - Do NOT answer questions with specifics (dates, prices, availability)\n\
         - Do NOT add commitments or promises that are not in the template\n\
         - Do NOT include internal information, file paths, or system details\n\
         - Keep the tone warm and professional\n\n\
         Return ONLY the personalized email text.",
        ctx.from_name.as_deref().unwrap_or("Unknown"),
        ctx.from_email,
        if ctx.subject.is_empty() { "(no subject)" } else { ctx.subject.as_str() },
        ctx.body_preview,
        ctx.score.map_or_else(|| "n/a".to_string(), |s| s.to_string()),
        ctx.bucket,
    )
}

pub struct DraftWriter {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl DraftWriter {
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Personalized draft text. Empty output is an error.
    pub async fn write(&self, template: &str, ctx: &DraftContext) -> Result<String, Error> {
        let request = CompletionRequest::new(vec![ChatMessage::user(build_writer_prompt(
            template, ctx,
        ))])
        .with_model(&self.model)
        .with_temperature(WRITER_TEMPERATURE)
        .with_max_tokens(WRITER_MAX_TOKENS);

        let response = self.llm.complete(request).await?;
        let draft = response.content.trim().to_string();
        if draft.is_empty() {
            return Err(ValidationError::MalformedResponse {
                component: "draft_writer".into(),
                reason: "empty draft".into(),
            }
            .into());
        }
        debug!(chars = draft.len(), "Writer produced draft");
        Ok(draft)
    }
}
