//! Three-layer draft generation: writer, independent reviewer, content gate.
//!
//! The stored draft is either the writer's text after passing every layer,
//! or the vetted template verbatim.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::drafting::gate::ContentGate;
use crate::drafting::reviewer::DraftReviewer;
use crate::drafting::templates::TemplateStore;
use crate::drafting::writer::{DraftContext, DraftWriter};
use crate::error::DraftError;
use crate::store::{Database, DraftStatus, StoredMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftOutcome {
    pub draft: String,
    pub fallback: bool,
    /// Why the template was used instead of the writer's draft.
    pub reason: Option<String>,
}

impl DraftOutcome {
    pub fn status(&self) -> DraftStatus {
        if self.fallback {
            DraftStatus::Fallback
        } else {
            DraftStatus::Generated
        }
    }
}

pub struct Drafter {
    db: Arc<dyn Database>,
    templates: TemplateStore,
    writer: DraftWriter,
    reviewer: DraftReviewer,
    gate: ContentGate,
}

impl Drafter {
    pub fn new(
        db: Arc<dyn Database>,
        templates: TemplateStore,
        writer: DraftWriter,
        reviewer: DraftReviewer,
    ) -> Self {
        Self {
            db,
            templates,
            writer,
            reviewer,
            gate: ContentGate::default_rules(),
        }
    }

    pub fn with_gate(mut self, gate: ContentGate) -> Self {
        self.gate = gate;
        self
    }

    /// Generate and store a draft for a lead. Returns `None` for non-leads.
    ///
    /// A missing template is an error and nothing is stored.
    pub async fn generate(&self, msg: &StoredMessage) -> Result<Option<DraftOutcome>, DraftError> {
        if !msg.is_lead() {
            info!(message_id = msg.id, "Draft skipped, not a lead");
            return Ok(None);
        }
        let bucket = msg.score_bucket.as_deref().unwrap_or("");
        let template = self.templates.get(&msg.account_id, bucket)?;
        let ctx = DraftContext::from_message(msg, bucket);

        info!(message_id = msg.id, bucket, "Draft generation started");
        let outcome = self.run_layers(msg.id, &template, &ctx).await;

        self.db
            .set_draft(msg.id, outcome.status(), &outcome.draft)
            .await?;
        info!(
            message_id = msg.id,
            status = outcome.status().as_str(),
            "Draft stored"
        );
        Ok(Some(outcome))
    }

    async fn run_layers(&self, id: i64, template: &str, ctx: &DraftContext) -> DraftOutcome {
        let fallback = |reason: String| DraftOutcome {
            draft: template.to_string(),
            fallback: true,
            reason: Some(reason),
        };

        let candidate = match self.writer.write(template, ctx).await {
            Ok(draft) => draft,
            Err(e) => {
                warn!(message_id = id, error = %e, "Writer failed, using template");
                return fallback(format!("writer: {e}"));
            }
        };

        let review = self.reviewer.review(&candidate, template, ctx).await;
        let gate = self.gate.check(&candidate);

        let mut reasons = Vec::new();
        if !review.approved {
            warn!(message_id = id, failures = ?review.failures, "Reviewer blocked draft");
            reasons.push(format!("reviewer: {}", review.failures.join("; ")));
        }
        if !gate.passed {
            warn!(message_id = id, reasons = ?gate.blocked_reasons, "Content gate blocked draft");
            reasons.push(format!("gate: {}", gate.blocked_reasons.join(", ")));
        }

        if reasons.is_empty() {
            DraftOutcome {
                draft: candidate,
                fallback: false,
                reason: None,
            }
        } else {
            fallback(reasons.join(" | "))
        }
    }
}
