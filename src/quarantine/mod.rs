//! Quarantine: the trust boundary every inbound message crosses first.
//!
//! 1. Deterministic sanitizer (no network)
//! 2. LLM threat scanner (fail-closed)

pub mod sanitizer;
pub mod scanner;

pub use sanitizer::{ExtractedLink, SanitizedContent, sanitize};
pub use scanner::{RiskLevel, ScanInput, ScanVerdict, ThreatScanner};

use tracing::info;

use crate::mail::RawMail;

/// Sanitized content plus the scanner's verdict.
#[derive(Debug, Clone)]
pub struct QuarantineResult {
    pub content: SanitizedContent,
    pub verdict: ScanVerdict,
}

pub struct Quarantine {
    scanner: ThreatScanner,
}

impl Quarantine {
    pub fn new(scanner: ThreatScanner) -> Self {
        Self { scanner }
    }

    pub async fn process(&self, mail: &RawMail) -> QuarantineResult {
        let content = sanitize(mail);
        let sanitized_subject = sanitizer::decode_entities(&mail.subject);
        let verdict = self
            .scanner
            .scan(&ScanInput {
                from_email: &mail.from_email,
                from_name: mail.from_name.as_deref(),
                subject: &sanitized_subject,
                body_text: &content.body_text,
                links: &content.links,
            })
            .await;

        info!(
            message_id = %mail.message_id,
            status = %verdict.status,
            links = content.links.len(),
            images = content.images.len(),
            "Quarantine complete"
        );
        QuarantineResult { content, verdict }
    }
}
