//! Read-only IMAP mail source over rustls.
//!
//! Each call opens its own session on a blocking thread. Only `UID SEARCH`
//! and `UID FETCH BODY.PEEK[...]` are issued, so `\Seen` flags never change.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::config::{AccountConfig, ImapSettings};
use crate::error::MailError;
use crate::mail::parse::{Mailbox, parse_envelope, parse_message};
use crate::mail::{Envelope, MailSource, RawMail};

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest literal accepted from the server.
const MAX_LITERAL_BYTES: usize = 50 * 1024 * 1024;

/// Envelope header fetch is chunked to keep command lines short.
const FETCH_CHUNK: usize = 100;

static LITERAL_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}\r\n$").expect("valid regex"));
static UID_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bUID (\d+)").expect("valid regex"));
static INTERNALDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"INTERNALDATE "([^"]+)""#).expect("valid regex"));

#[derive(Debug, Clone)]
struct ImapAccount {
    email: String,
    settings: ImapSettings,
}

/// Production [`MailSource`] for accounts with IMAP settings.
pub struct ImapSource {
    accounts: HashMap<String, ImapAccount>,
}

impl ImapSource {
    /// Accounts without an `imap` section are ignored.
    pub fn new(accounts: &[AccountConfig]) -> Self {
        let accounts = accounts
            .iter()
            .filter_map(|a| {
                a.imap.clone().map(|settings| {
                    (
                        a.id.clone(),
                        ImapAccount {
                            email: a.email.clone(),
                            settings,
                        },
                    )
                })
            })
            .collect();
        Self { accounts }
    }

    fn account(&self, id: &str) -> Result<ImapAccount, MailError> {
        self.accounts
            .get(id)
            .cloned()
            .ok_or_else(|| MailError::UnknownAccount(id.to_string()))
    }

    async fn blocking<T, F>(&self, account: &str, f: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&ImapAccount, &mut Session) -> Result<T, MailError> + Send + 'static,
    {
        let acct = self.account(account)?;
        let id = account.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = Session::open(&id, &acct.settings)?;
            let result = f(&acct, &mut session);
            session.logout();
            result
        })
        .await
        .map_err(|e| MailError::Protocol(format!("IMAP worker panicked: {e}")))?
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn list_envelopes(
        &self,
        account: &str,
        folder: &str,
        after_uid: u32,
    ) -> Result<Vec<Envelope>, MailError> {
        let folder = folder.to_string();
        self.blocking(account, move |_, session| {
            session.examine(&folder)?;
            let next = after_uid.saturating_add(1);
            // `n:*` always matches the highest UID, even when it is below n.
            let uids: Vec<u32> = session
                .search(&format!("UID {next}:*"))?
                .into_iter()
                .filter(|uid| *uid > after_uid)
                .collect();
            session.envelopes(&uids)
        })
        .await
    }

    async fn list_since(
        &self,
        account: &str,
        folder: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Envelope>, MailError> {
        let folder = folder.to_string();
        self.blocking(account, move |_, session| {
            session.examine(&folder)?;
            let uids = session.search(&format!("SINCE {}", since.format("%d-%b-%Y")))?;
            session.envelopes(&uids)
        })
        .await
    }

    async fn fetch(&self, account: &str, folder: &str, uid: u32) -> Result<RawMail, MailError> {
        let folder = folder.to_string();
        let account_id = account.to_string();
        self.blocking(account, move |acct, session| {
            session.examine(&folder)?;
            let items = session.command(&format!("UID FETCH {uid} (UID BODY.PEEK[])"))?;
            let raw = items
                .into_iter()
                .find_map(|item| item.literal)
                .ok_or_else(|| MailError::NotFound {
                    account: account_id.clone(),
                    uid,
                })?;
            parse_message(
                Mailbox {
                    account_id: &account_id,
                    email: &acct.email,
                },
                uid,
                &raw,
            )
        })
        .await
    }
}

/// One untagged response line, with its literal if it carried one.
#[derive(Debug, Default)]
struct Untagged {
    text: String,
    literal: Option<Vec<u8>>,
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

struct Session {
    tls: TlsStream,
    host: String,
    next_tag: u32,
}

impl Session {
    fn open(account: &str, settings: &ImapSettings) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::Connect {
            host: settings.host.clone(),
            reason,
        };
        let password = std::env::var(&settings.password_env).map_err(|_| {
            connect_err(format!("password variable {} is not set", settings.password_env))
        })?;

        let tcp = TcpStream::connect((settings.host.as_str(), settings.port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(READ_TIMEOUT))?;
        tcp.set_write_timeout(Some(READ_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(settings.host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            host: settings.host.clone(),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with(b"* OK") && !greeting.starts_with(b"* PREAUTH") {
            return Err(connect_err(String::from_utf8_lossy(&greeting).trim().to_string()));
        }

        let login = format!(
            "LOGIN {} {}",
            quote(&settings.username),
            quote(&password)
        );
        session.command(&login).map_err(|e| match e {
            MailError::Protocol(_) => MailError::LoginFailed {
                account: account.to_string(),
            },
            other => other,
        })?;
        debug!(account, host = %session.host, "IMAP session opened");
        Ok(session)
    }

    /// Read-only select.
    fn examine(&mut self, folder: &str) -> Result<(), MailError> {
        self.command(&format!("EXAMINE {}", quote(folder)))?;
        Ok(())
    }

    fn search(&mut self, criteria: &str) -> Result<Vec<u32>, MailError> {
        let items = self.command(&format!("UID SEARCH {criteria}"))?;
        let mut uids: Vec<u32> = items
            .iter()
            .filter_map(|item| item.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
            .collect();
        uids.sort_unstable();
        uids.dedup();
        Ok(uids)
    }

    fn envelopes(&mut self, uids: &[u32]) -> Result<Vec<Envelope>, MailError> {
        let mut envelopes = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(FETCH_CHUNK) {
            let set = chunk
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let items = self.command(&format!(
                "UID FETCH {set} (UID INTERNALDATE BODY.PEEK[HEADER.FIELDS (FROM SUBJECT DATE)])"
            ))?;
            for item in items {
                let Some(headers) = item.literal else {
                    continue;
                };
                let Some(uid) = UID_ITEM
                    .captures(&item.text)
                    .and_then(|c| c[1].parse::<u32>().ok())
                else {
                    continue;
                };
                let internal = INTERNALDATE
                    .captures(&item.text)
                    .and_then(|c| parse_internal_date(&c[1]));
                envelopes.push(parse_envelope(uid, &headers, internal));
            }
        }
        envelopes.sort_by_key(|e| e.uid);
        Ok(envelopes)
    }

    /// Send a tagged command and collect untagged responses until its
    /// completion. Anything but a tagged `OK` is a protocol error.
    fn command(&mut self, cmd: &str) -> Result<Vec<Untagged>, MailError> {
        let tag = format!("L{}", self.next_tag);
        self.next_tag += 1;
        self.tls.write_all(format!("{tag} {cmd}\r\n").as_bytes())?;
        self.tls.flush()?;

        let mut items = Vec::new();
        loop {
            let line = self.read_line()?;
            if line.starts_with(format!("{tag} ").as_bytes()) {
                let status = String::from_utf8_lossy(&line[tag.len() + 1..]).trim().to_string();
                if status.starts_with("OK") {
                    return Ok(items);
                }
                let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
                return Err(MailError::Protocol(format!("{verb}: {status}")));
            }
            items.push(self.untagged(line)?);
        }
    }

    /// Assemble one untagged response, reading a literal when the line
    /// announces one and then the rest of the line after it.
    fn untagged(&mut self, first: Vec<u8>) -> Result<Untagged, MailError> {
        let mut text = String::from_utf8_lossy(&first).into_owned();
        let mut literal = None;
        while let Some(len) = LITERAL_SUFFIX
            .captures(&text)
            .and_then(|c| c[1].parse::<usize>().ok())
        {
            if len > MAX_LITERAL_BYTES {
                return Err(MailError::Protocol(format!("literal of {len} bytes exceeds limit")));
            }
            let mut buf = vec![0u8; len];
            self.tls.read_exact(&mut buf)?;
            // Keep the first literal; later ones are unused header items.
            if literal.is_none() {
                literal = Some(buf);
            }
            let rest = self.read_line()?;
            text.push_str(&String::from_utf8_lossy(&rest));
        }
        Ok(Untagged {
            text: text.trim_end().to_string(),
            literal,
        })
    }

    fn read_line(&mut self) -> Result<Vec<u8>, MailError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailError::Protocol("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(buf);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(host = %self.host, error = %e, "IMAP logout failed");
        }
    }
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// `INTERNALDATE` format, e.g. ` 2-Jun-2025 10:15:00 +0000`.
fn parse_internal_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z")
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
