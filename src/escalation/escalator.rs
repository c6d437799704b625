//! Idempotent escalation of scored leads.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, EscalationError};
use crate::escalation::notify::Notifier;
use crate::escalation::rules::{Priority, format_message, rule_for};
use crate::escalation::tasks::{TaskRequest, TaskSink};
use crate::scoring::Bucket;
use crate::store::{Database, StoredMessage};

/// Body characters copied into a task description.
const TASK_BODY_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result", content = "detail")]
pub enum ChannelOutcome {
    /// The bucket's rule does not use this channel.
    NotRequired,
    /// The rule wants it but no channel is configured.
    Unavailable,
    Delivered,
    Failed(String),
}

impl ChannelOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    pub bucket: Bucket,
    pub priority: Option<Priority>,
    pub notify: ChannelOutcome,
    pub task: ChannelOutcome,
    pub task_id: Option<String>,
    /// Whether the message is now marked escalated.
    pub escalated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum EscalationOutcome {
    AlreadyEscalated,
    /// Not a scored lead, or a bucket with no escalation.
    Skipped { reason: String },
    Attempted(EscalationReport),
}

pub struct Escalator {
    db: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    tasks: Arc<dyn TaskSink>,
}

impl Escalator {
    pub fn new(db: Arc<dyn Database>, notifier: Arc<dyn Notifier>, tasks: Arc<dyn TaskSink>) -> Self {
        Self {
            db,
            notifier,
            tasks,
        }
    }

    pub async fn escalate(&self, id: i64) -> Result<EscalationOutcome, EscalationError> {
        let msg = self
            .db
            .get_message(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "message".into(),
                id: id.to_string(),
            })?;

        if msg.escalated {
            debug!(message_id = id, "Already escalated");
            return Ok(EscalationOutcome::AlreadyEscalated);
        }
        let bucket = match msg.score_bucket.as_deref().and_then(Bucket::parse) {
            Some(b) if msg.is_lead() => b,
            _ => {
                return Ok(EscalationOutcome::Skipped {
                    reason: "not a scored lead".into(),
                });
            }
        };
        let rule = rule_for(bucket);
        if rule.is_noop() {
            return Ok(EscalationOutcome::Skipped {
                reason: format!("no escalation for {bucket} bucket"),
            });
        }

        let notify = match rule.message_template {
            Some(template) if rule.notify => {
                if !self.notifier.is_enabled() {
                    ChannelOutcome::Unavailable
                } else {
                    let text = format_message(template, &msg);
                    match self.notifier.send_text(&text).await {
                        Ok(()) => ChannelOutcome::Delivered,
                        Err(e) => {
                            warn!(message_id = id, error = %e, "Lead notification failed");
                            ChannelOutcome::Failed(e.to_string())
                        }
                    }
                }
            }
            _ => ChannelOutcome::NotRequired,
        };

        let mut task_id = None;
        let task = match rule.priority {
            Some(priority) if rule.create_task => {
                if !self.tasks.is_enabled() {
                    ChannelOutcome::Unavailable
                } else {
                    match self.tasks.create_task(&task_for(&msg, bucket, priority)).await {
                        Ok(tid) => {
                            task_id = Some(tid).filter(|t| !t.is_empty());
                            ChannelOutcome::Delivered
                        }
                        Err(e) => {
                            warn!(message_id = id, error = %e, "Lead task creation failed");
                            ChannelOutcome::Failed(e.to_string())
                        }
                    }
                }
            }
            _ => ChannelOutcome::NotRequired,
        };

        let escalated = if notify.delivered() || task.delivered() {
            self.db.mark_escalated(id).await?
        } else {
            false
        };

        info!(
            message_id = id,
            bucket = %bucket,
            notified = notify.delivered(),
            task_created = task.delivered(),
            escalated,
            "Escalation attempted"
        );
        Ok(EscalationOutcome::Attempted(EscalationReport {
            bucket,
            priority: rule.priority,
            notify,
            task,
            task_id,
            escalated,
        }))
    }

    /// Operator alert through the same notifier. Failures are logged only.
    pub async fn alert(&self, text: &str) {
        alert(self.notifier.as_ref(), text).await;
    }
}

/// Send an operator alert, logging instead of failing.
pub async fn alert(notifier: &dyn Notifier, text: &str) {
    if !notifier.is_enabled() {
        warn!(alert = %text, "Operator alert (no notifier configured)");
        return;
    }
    if let Err(e) = notifier.send_text(text).await {
        warn!(alert = %text, error = %e, "Operator alert could not be delivered");
    }
}

fn task_for(msg: &StoredMessage, bucket: Bucket, priority: Priority) -> TaskRequest {
    let preview: String = msg.body_text.chars().take(TASK_BODY_CHARS).collect();
    let score = msg
        .score
        .map_or_else(|| "N/A".to_string(), |s| s.to_string());
    TaskRequest {
        title: format!("Lead: {}", msg.sender_display()),
        description: format!(
            "New {bucket} lead (score: {score})\n\nFrom: {} <{}>\nSubject: {}\nDomain: {}\n\n{preview}",
            msg.from_name.as_deref().unwrap_or(""),
            msg.from_email,
            msg.subject,
            msg.from_domain,
        ),
        priority,
        tags: vec!["lead".into(), bucket.as_str().into(), msg.account_id.clone()],
        metadata: serde_json::json!({
            "message_id": msg.id,
            "score": msg.score,
            "score_bucket": bucket.as_str(),
            "from_domain": msg.from_domain,
        }),
    }
}
