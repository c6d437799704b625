//! Mail source abstraction: the pipeline's only view of a mailbox.
//!
//! Implementations list envelopes above a UID and fetch full messages.
//! Nothing here mutates the mailbox.

pub mod imap;
pub mod parse;

pub use imap::ImapSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::MailError;

/// Attachment metadata. Content is never kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub size: usize,
    pub content_type: String,
}

/// Header-level summary of a message in a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub uid: u32,
    pub date: DateTime<Utc>,
    pub from: String,
    pub subject: String,
}

impl Envelope {
    pub fn sender_domain(&self) -> String {
        domain_of(&self.from)
    }
}

/// A fully fetched, still-untrusted message.
#[derive(Debug, Clone)]
pub struct RawMail {
    pub uid: u32,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to_email: String,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub date: DateTime<Utc>,
}

impl RawMail {
    pub fn sender_domain(&self) -> String {
        domain_of(&self.from_email)
    }

    pub fn is_reply(&self) -> bool {
        self.in_reply_to.is_some() || self.subject.trim_start().to_lowercase().starts_with("re:")
    }
}

/// Lowercased domain part of an address, or empty.
pub fn domain_of(address: &str) -> String {
    address
        .rsplit_once('@')
        .map(|(_, d)| d.trim().trim_end_matches('>').to_lowercase())
        .unwrap_or_default()
}

/// Read-only access to an account's mailbox.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Envelopes in `folder` with UID strictly greater than `after_uid`, ascending by UID.
    async fn list_envelopes(
        &self,
        account: &str,
        folder: &str,
        after_uid: u32,
    ) -> Result<Vec<Envelope>, MailError>;

    /// Envelopes received on or after `since`, ascending by UID.
    async fn list_since(
        &self,
        account: &str,
        folder: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, MailError>;

    async fn fetch(&self, account: &str, folder: &str, uid: u32) -> Result<RawMail, MailError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("Jane@Acme.COM"), "acme.com");
        assert_eq!(domain_of("<bob@x.io>"), "x.io");
        assert_eq!(domain_of("not-an-address"), "");
    }

    #[test]
    fn reply_detection() {
        let mut mail = RawMail {
            uid: 1,
            message_id: "<a@b>".into(),
            thread_id: None,
            in_reply_to: None,
            from_email: "a@b.com".into(),
            from_name: None,
            to_email: "me@c.com".into(),
            subject: "Hello".into(),
            text_body: None,
            html_body: None,
            attachments: vec![],
            date: Utc::now(),
        };
        assert!(!mail.is_reply());
        mail.subject = "RE: Hello".into();
        assert!(mail.is_reply());
        mail.subject = "Hello".into();
        mail.in_reply_to = Some("<x@y>".into());
        assert!(mail.is_reply());
    }
}
