//! RFC 5322 bytes to [`RawMail`] / [`Envelope`] via mail-parser.

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MessageParser, MimeHeaders};

use crate::error::MailError;
use crate::mail::{AttachmentMeta, Envelope, RawMail};

/// Identity of the mailbox a message was fetched from, used for fallbacks.
#[derive(Debug, Clone, Copy)]
pub struct Mailbox<'a> {
    pub account_id: &'a str,
    pub email: &'a str,
}

/// Parse a full message. Missing `Message-ID` falls back to `{account}-{uid}`,
/// missing `To` to the mailbox address, missing `Date` to now.
pub fn parse_message(mailbox: Mailbox<'_>, uid: u32, raw: &[u8]) -> Result<RawMail, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse {
            uid,
            reason: "not an RFC 5322 message".into(),
        })?;

    let (from_email, from_name) = sender(&parsed);
    let in_reply_to = first_text(parsed.in_reply_to()).map(|s| bracket(&s));
    let message_id = parsed
        .message_id()
        .map(bracket)
        .unwrap_or_else(|| format!("{}-{uid}", mailbox.account_id));
    let to_email = parsed
        .to()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| mailbox.email.to_string());

    let attachments = parsed
        .attachments()
        .map(|part| AttachmentMeta {
            filename: part.attachment_name().unwrap_or("unnamed").to_string(),
            size: part.contents().len(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{sub}", ct.ctype()),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into()),
        })
        .collect();

    Ok(RawMail {
        uid,
        message_id,
        thread_id: in_reply_to.clone(),
        in_reply_to,
        from_email,
        from_name,
        to_email,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
        text_body: parsed.body_text(0).map(|t| t.into_owned()),
        html_body: parsed.body_html(0).map(|h| h.into_owned()),
        attachments,
        date: date_of(&parsed).unwrap_or_else(Utc::now),
    })
}

/// Parse a header-only fetch into an envelope. `fallback_date` is the
/// server's INTERNALDATE when the `Date` header is missing or broken.
pub fn parse_envelope(uid: u32, headers: &[u8], fallback_date: Option<DateTime<Utc>>) -> Envelope {
    let Some(parsed) = MessageParser::default().parse(headers) else {
        return Envelope {
            uid,
            date: fallback_date.unwrap_or_else(Utc::now),
            from: String::new(),
            subject: String::new(),
        };
    };
    Envelope {
        uid,
        date: date_of(&parsed).or(fallback_date).unwrap_or_else(Utc::now),
        from: sender(&parsed).0,
        subject: parsed.subject().unwrap_or_default().trim().to_string(),
    }
}

fn sender(parsed: &Message<'_>) -> (String, Option<String>) {
    let addr = parsed.from().and_then(|a| a.first());
    let email = addr
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_else(|| "unknown".into());
    let name = addr
        .and_then(|a| a.name())
        .map(|n| n.trim().trim_matches('"').to_string())
        .filter(|n| !n.is_empty());
    (email, name)
}

fn first_text(value: &HeaderValue<'_>) -> Option<String> {
    match value {
        HeaderValue::Text(t) => Some(t.to_string()),
        HeaderValue::TextList(list) => list.first().map(|t| t.to_string()),
        _ => None,
    }
}

/// mail-parser strips the angle brackets from message ids; stored ids keep them.
fn bracket(id: &str) -> String {
    let id = id.trim();
    if id.starts_with('<') {
        id.to_string()
    } else {
        format!("<{id}>")
    }
}

fn date_of(parsed: &Message<'_>) -> Option<DateTime<Utc>> {
    parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAILBOX: Mailbox<'static> = Mailbox {
        account_id: "main",
        email: "me@studio.test",
    };

    const INQUIRY: &str = "From: \"Jane Doe\" <Jane@Acme.test>\r\n\
To: me@studio.test\r\n\
Subject: Wedding inquiry\r\n\
Message-ID: <abc123@acme.test>\r\n\
Date: Mon, 2 Jun 2025 10:15:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hi, we are getting married in May.\r\n";

    #[test]
    fn parses_headers_and_body() {
        let mail = parse_message(MAILBOX, 42, INQUIRY.as_bytes()).unwrap();
        assert_eq!(mail.uid, 42);
        assert_eq!(mail.message_id, "<abc123@acme.test>");
        assert_eq!(mail.from_email, "jane@acme.test");
        assert_eq!(mail.from_name.as_deref(), Some("Jane Doe"));
        assert_eq!(mail.sender_domain(), "acme.test");
        assert_eq!(mail.subject, "Wedding inquiry");
        assert!(mail.text_body.as_deref().unwrap().contains("getting married"));
        assert_eq!(mail.date.to_rfc3339(), "2025-06-02T10:15:00+00:00");
        assert!(!mail.is_reply());
    }

    #[test]
    fn reply_headers_set_thread() {
        let raw = "From: bob@x.test\r\nSubject: Re: Hello\r\nIn-Reply-To: <root@x.test>\r\n\r\nok\r\n";
        let mail = parse_message(MAILBOX, 1, raw.as_bytes()).unwrap();
        assert_eq!(mail.in_reply_to.as_deref(), Some("<root@x.test>"));
        assert_eq!(mail.thread_id.as_deref(), Some("<root@x.test>"));
        assert!(mail.is_reply());
    }

    #[test]
    fn missing_headers_fall_back() {
        let raw = "From: bob@x.test\r\n\r\nbody\r\n";
        let mail = parse_message(MAILBOX, 9, raw.as_bytes()).unwrap();
        assert_eq!(mail.message_id, "main-9");
        assert_eq!(mail.to_email, "me@studio.test");
        assert_eq!(mail.subject, "");
        assert!(mail.from_name.is_none());
    }

    #[test]
    fn attachments_keep_metadata_only() {
        let raw = "From: a@b.test\r\n\
Subject: files\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"brief.pdf\"\r\n\
\r\n\
%PDF-1.4\r\n\
--XX--\r\n";
        let mail = parse_message(MAILBOX, 3, raw.as_bytes()).unwrap();
        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].filename, "brief.pdf");
        assert_eq!(mail.attachments[0].content_type, "application/pdf");
        assert!(mail.text_body.unwrap().contains("see attached"));
    }

    #[test]
    fn envelope_from_header_block() {
        let headers = "From: Jane <jane@acme.test>\r\nSubject: Hi\r\nDate: Mon, 2 Jun 2025 10:15:00 +0000\r\n\r\n";
        let env = parse_envelope(5, headers.as_bytes(), None);
        assert_eq!(env.uid, 5);
        assert_eq!(env.from, "jane@acme.test");
        assert_eq!(env.sender_domain(), "acme.test");
        assert_eq!(env.subject, "Hi");
    }

    #[test]
    fn envelope_uses_internal_date_when_header_missing() {
        let internal = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let env = parse_envelope(6, b"From: a@b.test\r\n\r\n", Some(internal));
        assert_eq!(env.date, internal);
    }
}
