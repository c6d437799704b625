//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    Database, DraftStatus, InsertOutcome, MessageCounts, NewMessage, NewScoringLog,
    NewStageAudit, PollCursor, QuarantineStatus, ScoreUpdate, ScoringLogEntry, SenderResearch,
    StageAuditEntry, StoredMessage,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(
                row_to_message(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn query_audit(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<StageAuditEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            out.push(
                row_to_audit(&row)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn scalar_i64(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }

    async fn group_counts(&self, expr: &str) -> Result<BTreeMap<String, i64>, DatabaseError> {
        let sql = format!("SELECT {expr} AS k, COUNT(*) FROM messages GROUP BY k");
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("group_counts: {e}")))?;
        let mut out = BTreeMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("group_counts: {e}")))?
        {
            let key: String = row.get(0).unwrap_or_else(|_| "unknown".to_string());
            let count: i64 = row.get(1).unwrap_or(0);
            out.insert(key, count);
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(ndt) = date.and_hms_opt(0, 0, 0)
    {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_json(s: Option<String>, fallback: serde_json::Value) -> serde_json::Value {
    s.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(fallback)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

const MESSAGE_COLUMNS: &str = "id, account_id, message_id, thread_id, from_email, from_name, \
    from_domain, to_email, subject, body_text, body_html_sanitized, received_at, fetched_at, \
    is_reply, in_reply_to, quarantine_status, quarantine_reason, classification, \
    classification_label, score, score_bucket, score_label, stage_label, draft_status, \
    draft_text, escalated, metadata";

const AUDIT_COLUMNS: &str =
    "id, message_id, thread_id, from_stage, to_stage, changed_by, reason, changed_at";

/// Map a libsql Row to a StoredMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let received: String = row.get(11)?;
    let fetched: String = row.get(12)?;
    let status: String = row.get(15)?;
    let draft_status: String = row.get(23)?;

    Ok(StoredMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        message_id: row.get(2)?,
        thread_id: row.get(3).ok(),
        from_email: row.get(4)?,
        from_name: row.get(5).ok(),
        from_domain: row.get(6)?,
        to_email: row.get(7)?,
        subject: row.get(8)?,
        body_text: row.get(9)?,
        body_html: row.get(10)?,
        received_at: parse_datetime(&received),
        fetched_at: parse_datetime(&fetched),
        is_reply: row.get::<i64>(13)? != 0,
        in_reply_to: row.get(14).ok(),
        quarantine_status: QuarantineStatus::parse(&status),
        quarantine_reason: row.get(16).ok(),
        classification: row.get(17).ok(),
        classification_label: row.get(18).ok(),
        score: row.get(19).ok(),
        score_bucket: row.get(20).ok(),
        score_label: row.get(21).ok(),
        stage_label: row.get(22).ok(),
        draft_status: DraftStatus::parse(&draft_status),
        draft_text: row.get(24).ok(),
        escalated: row.get::<i64>(25)? != 0,
        metadata: parse_json(row.get(26).ok(), serde_json::json!({})),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<StageAuditEntry, libsql::Error> {
    let changed_at: String = row.get(7)?;
    Ok(StageAuditEntry {
        id: row.get(0)?,
        message_id: row.get(1)?,
        thread_id: row.get(2).ok(),
        from_stage: row.get(3).ok(),
        to_stage: row.get(4)?,
        changed_by: row.get(5)?,
        reason: row.get(6).ok(),
        changed_at: parse_datetime(&changed_at),
    })
}

fn row_to_scoring_log(row: &libsql::Row) -> Result<ScoringLogEntry, libsql::Error> {
    let scored_at: String = row.get(6)?;
    Ok(ScoringLogEntry {
        id: row.get(0)?,
        message_id: row.get(1)?,
        rubric_version: row.get(2)?,
        dimensions: parse_json(row.get(3).ok(), serde_json::json!({})),
        flags: parse_json(row.get(4).ok(), serde_json::json!([])),
        raw_output: row.get(5)?,
        scored_at: parse_datetime(&scored_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, msg: &NewMessage) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO messages (account_id, message_id, thread_id, from_email, \
                 from_name, from_domain, to_email, subject, body_text, body_html_sanitized, \
                 received_at, fetched_at, is_reply, in_reply_to, quarantine_status, \
                 quarantine_reason, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    msg.account_id.as_str(),
                    msg.message_id.as_str(),
                    opt_text(msg.thread_id.as_deref()),
                    msg.from_email.as_str(),
                    opt_text(msg.from_name.as_deref()),
                    msg.from_domain.as_str(),
                    msg.to_email.as_str(),
                    msg.subject.as_str(),
                    msg.body_text.as_str(),
                    msg.body_html.as_str(),
                    msg.received_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    i64::from(msg.is_reply),
                    opt_text(msg.in_reply_to.as_deref()),
                    msg.quarantine_status.as_str(),
                    opt_text(msg.quarantine_reason.as_deref()),
                    msg.metadata.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        if changed == 0 {
            let existing = self
                .scalar_i64(
                    "SELECT id FROM messages WHERE message_id = ?1",
                    params![msg.message_id.as_str()],
                    "insert_message lookup",
                )
                .await?;
            debug!(message_id = %msg.message_id, "Duplicate message id, insert skipped");
            return Ok(InsertOutcome::Duplicate(existing));
        }

        let id = conn.last_insert_rowid();
        debug!(id, message_id = %msg.message_id, status = %msg.quarantine_status, "Message stored");
        Ok(InsertOutcome::Inserted(id))
    }

    async fn get_message(&self, id: i64) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut found = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                "get_message",
            )
            .await?;
        Ok(found.pop())
    }

    async fn get_message_by_external_id(
        &self,
        message_id: &str,
    ) -> Result<Option<StoredMessage>, DatabaseError> {
        let mut found = self
            .query_messages(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
                params![message_id],
                "get_message_by_external_id",
            )
            .await?;
        Ok(found.pop())
    }

    async fn message_exists(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .scalar_i64(
                "SELECT COUNT(*) FROM messages WHERE message_id = ?1",
                params![message_id],
                "message_exists",
            )
            .await?;
        Ok(count > 0)
    }

    async fn sender_domain_seen(
        &self,
        account_id: &str,
        domain: &str,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .scalar_i64(
                "SELECT COUNT(*) FROM messages WHERE account_id = ?1 AND from_domain = ?2",
                params![account_id, domain],
                "sender_domain_seen",
            )
            .await?;
        Ok(count > 0)
    }

    async fn clean_messages_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        match since {
            Some(since) => {
                self.query_messages(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages \
                         WHERE quarantine_status = 'clean' AND received_at >= ?1 ORDER BY id"
                    ),
                    params![since.to_rfc3339()],
                    "clean_messages_since",
                )
                .await
            }
            None => {
                self.query_messages(
                    &format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages \
                         WHERE quarantine_status = 'clean' ORDER BY id"
                    ),
                    (),
                    "clean_messages_since",
                )
                .await
            }
        }
    }

    async fn recent_messages(
        &self,
        since: DateTime<Utc>,
        leads_only: bool,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let lead_filter = if leads_only {
            " AND classification = 'lead'"
        } else {
            ""
        };
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE received_at >= ?1{lead_filter} \
                 ORDER BY received_at DESC, id DESC LIMIT ?2"
            ),
            params![since.to_rfc3339(), i64::try_from(limit).unwrap_or(i64::MAX)],
            "recent_messages",
        )
        .await
    }

    async fn message_counts(&self) -> Result<MessageCounts, DatabaseError> {
        Ok(MessageCounts {
            total: self
                .scalar_i64("SELECT COUNT(*) FROM messages", (), "message_counts")
                .await?,
            leads: self
                .scalar_i64(
                    "SELECT COUNT(*) FROM messages WHERE classification = 'lead'",
                    (),
                    "message_counts",
                )
                .await?,
            escalated: self
                .scalar_i64(
                    "SELECT COUNT(*) FROM messages WHERE escalated = 1",
                    (),
                    "message_counts",
                )
                .await?,
            by_status: self.group_counts("quarantine_status").await?,
            by_classification: self
                .group_counts("COALESCE(classification, 'unscored')")
                .await?,
            by_bucket: self.group_counts("COALESCE(score_bucket, 'none')").await?,
            by_account: self.group_counts("account_id").await?,
        })
    }

    // ── Scoring ─────────────────────────────────────────────────────

    async fn set_score(&self, id: i64, update: &ScoreUpdate) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET classification = ?1, classification_label = ?2, \
                 score = ?3, score_bucket = ?4 WHERE id = ?5",
                params![
                    update.classification.as_str(),
                    opt_text(update.classification_label.as_deref()),
                    opt_int(update.score),
                    opt_text(update.bucket.as_deref()),
                    id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_score: {e}")))?;
        Ok(())
    }

    async fn append_scoring_log(&self, entry: &NewScoringLog) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scoring_log (message_id, rubric_version, dimensions, flags, raw_output, scored_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.message_id,
                entry.rubric_version.as_str(),
                entry.dimensions.to_string(),
                entry.flags.to_string(),
                entry.raw_output.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("append_scoring_log: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn latest_scoring_log(
        &self,
        message_id: i64,
    ) -> Result<Option<ScoringLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, message_id, rubric_version, dimensions, flags, raw_output, scored_at \
                 FROM scoring_log WHERE message_id = ?1 ORDER BY id DESC LIMIT 1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_scoring_log: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_scoring_log(&row).map_err(|e| {
                DatabaseError::Query(format!("latest_scoring_log row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_scoring_log: {e}"))),
        }
    }

    async fn count_stale_scoring_rows(
        &self,
        current_version: &str,
    ) -> Result<i64, DatabaseError> {
        self.scalar_i64(
            "SELECT COUNT(*) FROM scoring_log WHERE rubric_version != ?1",
            params![current_version],
            "count_stale_scoring_rows",
        )
        .await
    }

    async fn stale_scored_messages(
        &self,
        current_version: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT s.message_id FROM scoring_log s \
                 JOIN (SELECT message_id, MAX(id) AS max_id FROM scoring_log GROUP BY message_id) latest \
                   ON latest.max_id = s.id \
                 WHERE s.rubric_version != ?1 ORDER BY s.message_id",
                params![current_version],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_scored_messages: {e}")))?;
        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("stale_scored_messages: {e}")))?
        {
            ids.push(
                row.get::<i64>(0)
                    .map_err(|e| DatabaseError::Query(format!("stale_scored_messages: {e}")))?,
            );
        }
        Ok(ids)
    }

    // ── Labels and stages ───────────────────────────────────────────

    async fn set_score_label_if_absent(
        &self,
        id: i64,
        label: &str,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE messages SET score_label = ?1 WHERE id = ?2 AND score_label IS NULL",
                params![label, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_score_label_if_absent: {e}")))?;
        Ok(changed > 0)
    }

    async fn record_stage_change(
        &self,
        entry: &NewStageAudit,
        expected_label: Option<&str>,
        new_label: &str,
    ) -> Result<i64, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_stage_change begin: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE messages SET stage_label = ?1 WHERE id = ?2 AND stage_label IS ?3",
                params![new_label, entry.message_id, opt_text(expected_label)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_stage_change update: {e}")))?;

        if changed == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("record_stage_change rollback: {e}")))?;
            return Err(DatabaseError::Constraint(format!(
                "stage of message {} is no longer {}",
                entry.message_id,
                expected_label.unwrap_or("(none)")
            )));
        }

        tx.execute(
            "INSERT INTO stage_audit (message_id, thread_id, from_stage, to_stage, changed_by, reason, changed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.message_id,
                opt_text(entry.thread_id.as_deref()),
                opt_text(entry.from_stage.as_deref()),
                entry.to_stage.as_str(),
                entry.changed_by.as_str(),
                opt_text(entry.reason.as_deref()),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_stage_change audit: {e}")))?;
        let audit_id = tx.last_insert_rowid();

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_stage_change commit: {e}")))?;
        Ok(audit_id)
    }

    async fn audit_trail(&self, message_id: i64) -> Result<Vec<StageAuditEntry>, DatabaseError> {
        self.query_audit(
            &format!(
                "SELECT {AUDIT_COLUMNS} FROM stage_audit WHERE message_id = ?1 ORDER BY changed_at, id"
            ),
            params![message_id],
            "audit_trail",
        )
        .await
    }

    async fn thread_audit_trail(
        &self,
        thread_id: &str,
    ) -> Result<Vec<StageAuditEntry>, DatabaseError> {
        self.query_audit(
            &format!(
                "SELECT {AUDIT_COLUMNS} FROM stage_audit WHERE thread_id = ?1 ORDER BY changed_at, id"
            ),
            params![thread_id],
            "thread_audit_trail",
        )
        .await
    }

    async fn append_drift_log(
        &self,
        id: i64,
        entry: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let message = self.get_message(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "message".into(),
            id: id.to_string(),
        })?;

        let mut metadata = match message.metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let log = metadata
            .entry("drift_log")
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if !log.is_array() {
            *log = serde_json::Value::Array(Vec::new());
        }
        if let serde_json::Value::Array(items) = log {
            items.push(entry.clone());
        }

        self.conn()
            .execute(
                "UPDATE messages SET metadata = ?1 WHERE id = ?2",
                params![serde_json::Value::Object(metadata).to_string(), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_drift_log: {e}")))?;
        Ok(())
    }

    // ── Drafts and escalation ───────────────────────────────────────

    async fn set_draft(
        &self,
        id: i64,
        status: DraftStatus,
        text: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE messages SET draft_status = ?1, draft_text = ?2 WHERE id = ?3",
                params![status.as_str(), text, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_draft: {e}")))?;
        Ok(())
    }

    async fn mark_escalated(&self, id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE messages SET escalated = 1 WHERE id = ?1 AND escalated = 0",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_escalated: {e}")))?;
        Ok(changed > 0)
    }

    // ── Research cache ──────────────────────────────────────────────

    async fn get_research(&self, domain: &str) -> Result<Option<SenderResearch>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT domain, domain_resolves, website_title, website_description, \
                 credibility_markers, social_links, researched_at \
                 FROM sender_research WHERE domain = ?1",
                params![domain],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_research: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_research: {e}"))),
        };

        let parse = |e: libsql::Error| DatabaseError::Query(format!("get_research row parse: {e}"));
        let markers: String = row.get(4).map_err(parse)?;
        let socials: String = row.get(5).map_err(parse)?;
        let researched_at: String = row.get(6).map_err(parse)?;

        Ok(Some(SenderResearch {
            domain: row.get(0).map_err(parse)?,
            domain_resolves: row.get::<i64>(1).map_err(parse)? != 0,
            website_title: row.get(2).ok(),
            website_description: row.get(3).ok(),
            credibility_markers: serde_json::from_str(&markers)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            social_links: serde_json::from_str(&socials)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            researched_at: parse_datetime(&researched_at),
        }))
    }

    async fn upsert_research(&self, research: &SenderResearch) -> Result<(), DatabaseError> {
        let markers = serde_json::to_string(&research.credibility_markers)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let socials = serde_json::to_string(&research.social_links)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                "INSERT OR REPLACE INTO sender_research (domain, domain_resolves, website_title, \
                 website_description, credibility_markers, social_links, researched_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    research.domain.as_str(),
                    i64::from(research.domain_resolves),
                    opt_text(research.website_title.as_deref()),
                    opt_text(research.website_description.as_deref()),
                    markers,
                    socials,
                    research.researched_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_research: {e}")))?;
        Ok(())
    }

    // ── Poll cursors ────────────────────────────────────────────────

    async fn get_cursor(&self, account_id: &str) -> Result<Option<PollCursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id, folder, last_seen_uid, last_poll_at FROM poll_cursors WHERE account_id = ?1",
                params![account_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |e: libsql::Error| DatabaseError::Query(format!("get_cursor: {e}"));
                let uid: i64 = row.get(2).map_err(parse)?;
                let polled: String = row.get(3).map_err(parse)?;
                Ok(Some(PollCursor {
                    account_id: row.get(0).map_err(parse)?,
                    folder: row.get(1).map_err(parse)?,
                    last_seen_uid: u32::try_from(uid).unwrap_or(0),
                    last_poll_at: parse_datetime(&polled),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cursor: {e}"))),
        }
    }

    async fn set_cursor(&self, cursor: &PollCursor) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO poll_cursors (account_id, folder, last_seen_uid, last_poll_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(account_id) DO UPDATE SET folder = excluded.folder, \
                 last_seen_uid = excluded.last_seen_uid, last_poll_at = excluded.last_poll_at",
                params![
                    cursor.account_id.as_str(),
                    cursor.folder.as_str(),
                    i64::from(cursor.last_seen_uid),
                    cursor.last_poll_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_cursor: {e}")))?;
        debug!(account = %cursor.account_id, uid = cursor.last_seen_uid, "Cursor advanced");
        Ok(())
    }
}
