//! Per-bucket escalation rules and message formatting.

use serde::Serialize;

use crate::scoring::Bucket;
use crate::store::StoredMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationRule {
    pub notify: bool,
    pub create_task: bool,
    pub priority: Option<Priority>,
    pub message_template: Option<&'static str>,
}

impl EscalationRule {
    pub fn is_noop(&self) -> bool {
        !self.notify && !self.create_task
    }
}

const HOT_LEAD: &str = "Hot lead from {from_name} ({from_domain}): {subject} (score {score})";
const NEW_LEAD: &str = "New lead from {from_name}: {subject} (score {score})";

pub fn rule_for(bucket: Bucket) -> EscalationRule {
    match bucket {
        Bucket::Exceptional => EscalationRule {
            notify: true,
            create_task: true,
            priority: Some(Priority::High),
            message_template: Some(HOT_LEAD),
        },
        Bucket::High => EscalationRule {
            notify: true,
            create_task: true,
            priority: Some(Priority::Medium),
            message_template: Some(NEW_LEAD),
        },
        Bucket::Medium => EscalationRule {
            notify: false,
            create_task: true,
            priority: Some(Priority::Low),
            message_template: None,
        },
        Bucket::Low | Bucket::Spam => EscalationRule {
            notify: false,
            create_task: false,
            priority: None,
            message_template: None,
        },
    }
}

/// Fill `{from_name} {from_domain} {from_email} {subject} {score} {score_bucket}`.
pub fn format_message(template: &str, msg: &StoredMessage) -> String {
    let subject = if msg.subject.is_empty() {
        "(no subject)"
    } else {
        msg.subject.as_str()
    };
    let score = msg
        .score
        .map_or_else(|| "N/A".to_string(), |s| s.to_string());
    template
        .replace("{from_name}", msg.sender_display())
        .replace("{from_domain}", &msg.from_domain)
        .replace("{from_email}", &msg.from_email)
        .replace("{subject}", subject)
        .replace("{score}", &score)
        .replace("{score_bucket}", msg.score_bucket.as_deref().unwrap_or("unknown"))
}
