//! Unified `Database` trait: single async interface for all persistence.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;

/// Outcome of the quarantine stage as persisted on the message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineStatus {
    Pending,
    Clean,
    Blocked,
    Held,
}

impl QuarantineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Clean => "clean",
            Self::Blocked => "blocked",
            Self::Held => "held",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "clean" => Self::Clean,
            "blocked" => Self::Blocked,
            "held" => Self::Held,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for QuarantineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    None,
    Generated,
    Fallback,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Generated => "generated",
            Self::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "generated" => Self::Generated,
            "fallback" => Self::Fallback,
            _ => Self::None,
        }
    }
}

/// A message as first written, right after quarantine.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub account_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub from_domain: String,
    pub to_email: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub received_at: DateTime<Utc>,
    pub is_reply: bool,
    pub in_reply_to: Option<String>,
    pub quarantine_status: QuarantineStatus,
    pub quarantine_reason: Option<String>,
    pub metadata: serde_json::Value,
}

/// A persisted inbound message with everything later stages have added.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub account_id: String,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub from_domain: String,
    pub to_email: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub received_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub is_reply: bool,
    pub in_reply_to: Option<String>,
    pub quarantine_status: QuarantineStatus,
    pub quarantine_reason: Option<String>,
    pub classification: Option<String>,
    pub classification_label: Option<String>,
    pub score: Option<i64>,
    pub score_bucket: Option<String>,
    pub score_label: Option<String>,
    pub stage_label: Option<String>,
    pub draft_status: DraftStatus,
    pub draft_text: Option<String>,
    pub escalated: bool,
    pub metadata: serde_json::Value,
}

impl StoredMessage {
    pub fn is_lead(&self) -> bool {
        self.classification.as_deref() == Some("lead")
    }

    /// Sender display name, falling back to the address.
    pub fn sender_display(&self) -> &str {
        self.from_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.from_email)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    /// The external message id was already stored; carries the existing row id.
    Duplicate(i64),
}

/// Fields the scorer writes back onto the message row.
#[derive(Debug, Clone)]
pub struct ScoreUpdate {
    pub classification: String,
    pub classification_label: Option<String>,
    pub score: Option<i64>,
    pub bucket: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewScoringLog {
    pub message_id: i64,
    pub rubric_version: String,
    pub dimensions: serde_json::Value,
    pub flags: serde_json::Value,
    pub raw_output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoringLogEntry {
    pub id: i64,
    pub message_id: i64,
    pub rubric_version: String,
    pub dimensions: serde_json::Value,
    pub flags: serde_json::Value,
    pub raw_output: String,
    pub scored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewStageAudit {
    pub message_id: i64,
    pub thread_id: Option<String>,
    pub from_stage: Option<String>,
    pub to_stage: String,
    pub changed_by: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageAuditEntry {
    pub id: i64,
    pub message_id: i64,
    pub thread_id: Option<String>,
    pub from_stage: Option<String>,
    pub to_stage: String,
    pub changed_by: String,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Cached result of researching a sender domain.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct SenderResearch {
    pub domain: String,
    pub domain_resolves: bool,
    pub website_title: Option<String>,
    pub website_description: Option<String>,
    pub credibility_markers: Vec<String>,
    pub social_links: BTreeMap<String, String>,
    pub researched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollCursor {
    pub account_id: String,
    pub folder: String,
    pub last_seen_uid: u32,
    pub last_poll_at: DateTime<Utc>,
}

/// Aggregate counts for the `stats` command.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageCounts {
    pub total: i64,
    pub leads: i64,
    pub escalated: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_classification: BTreeMap<String, i64>,
    pub by_bucket: BTreeMap<String, i64>,
    pub by_account: BTreeMap<String, i64>,
}

/// Backend-agnostic database trait covering messages, scoring, stages,
/// research cache, and poll cursors.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message. A second insert of the same external id is a no-op.
    async fn insert_message(&self, msg: &NewMessage) -> Result<InsertOutcome, DatabaseError>;

    async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, DatabaseError>;

    async fn get_message_by_external_id(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError>;

    async fn message_exists(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Whether this account already has any message from `domain`.
    async fn sender_domain_seen(&self, account_id: &str, domain: &str)
    -> Result<bool, DatabaseError>;

    /// Clean messages, optionally only those received at or after `since`.
    async fn clean_messages_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Most recent messages received after `since`, newest first.
    async fn recent_messages(
        &self,
        since: DateTime<Utc>,
        leads_only: bool,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn message_counts(&self) -> Result<MessageCounts, DatabaseError>;

    // ── Scoring ─────────────────────────────────────────────────────

    async fn set_score(&self, id: i64, update: &ScoreUpdate) -> Result<(), DatabaseError>;

    async fn append_scoring_log(&self, entry: &NewScoringLog) -> Result<i64, DatabaseError>;

    async fn latest_scoring_log(
        &self,
        message_id: i64,
    ) -> Result<Option<ScoringLogEntry>, DatabaseError>;

    /// Number of scoring-log rows written under a different rubric version.
    async fn count_stale_scoring_rows(&self, current_version: &str)
    -> Result<i64, DatabaseError>;

    /// Messages whose latest scoring-log row used a different rubric version.
    async fn stale_scored_messages(&self, current_version: &str)
    -> Result<Vec<i64>, DatabaseError>;

    // ── Labels and stages ───────────────────────────────────────────

    /// Write the score label only if none is set. Returns true when written.
    async fn set_score_label_if_absent(&self, id: i64, label: &str)
    -> Result<bool, DatabaseError>;

    /// Append an audit row and move the stage label, atomically.
    ///
    /// Fails with `DatabaseError::Constraint` (and writes nothing) if the
    /// stored stage label no longer equals `expected_label`.
    async fn record_stage_change(
        &self,
        entry: &NewStageAudit,
        expected_label: Option<&str>,
        new_label: &str,
    ) -> Result<i64, DatabaseError>;

    async fn audit_trail(&self, message_id: i64) -> Result<Vec<StageAuditEntry>, DatabaseError>;

    async fn thread_audit_trail(
        &self,
        thread_id: &str,
    ) -> Result<Vec<StageAuditEntry>, DatabaseError>;

    /// Append a JSON entry to `metadata.drift_log`.
    async fn append_drift_log(
        &self,
        id: i64,
        entry: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    // ── Drafts and escalation ───────────────────────────────────────

    async fn set_draft(
        &self,
        id: i64,
        status: DraftStatus,
        text: &str,
    ) -> Result<(), DatabaseError>;

    /// Flip `escalated` from 0 to 1. Returns false if it was already set.
    async fn mark_escalated(&self, id: i64) -> Result<bool, DatabaseError>;

    // ── Research cache ──────────────────────────────────────────────

    async fn get_research(&self, domain: &str) -> Result<Option<SenderResearch>, DatabaseError>;

    async fn upsert_research(&self, research: &SenderResearch) -> Result<(), DatabaseError>;

    // ── Poll cursors ────────────────────────────────────────────────

    async fn get_cursor(&self, account_id: &str) -> Result<Option<PollCursor>, DatabaseError>;

    async fn set_cursor(&self, cursor: &PollCursor) -> Result<(), DatabaseError>;
}
