//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL UNIQUE,
                thread_id TEXT,
                from_email TEXT NOT NULL,
                from_name TEXT,
                from_domain TEXT NOT NULL,
                to_email TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                body_text TEXT NOT NULL DEFAULT '',
                body_html_sanitized TEXT NOT NULL DEFAULT '',
                received_at TEXT NOT NULL,
                fetched_at TEXT NOT NULL,
                is_reply INTEGER NOT NULL DEFAULT 0,
                in_reply_to TEXT,
                quarantine_status TEXT NOT NULL DEFAULT 'pending',
                quarantine_reason TEXT,
                classification TEXT,
                classification_label TEXT,
                score INTEGER,
                score_bucket TEXT,
                score_label TEXT,
                stage_label TEXT,
                draft_status TEXT NOT NULL DEFAULT 'none',
                draft_text TEXT,
                escalated INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_messages_account ON messages(account_id);
            CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
            CREATE INDEX IF NOT EXISTS idx_messages_domain ON messages(account_id, from_domain);
            CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at);
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(quarantine_status);

            CREATE TABLE IF NOT EXISTS stage_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id),
                thread_id TEXT,
                from_stage TEXT,
                to_stage TEXT NOT NULL,
                changed_by TEXT NOT NULL DEFAULT 'system',
                reason TEXT,
                changed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stage_audit_message ON stage_audit(message_id);
            CREATE INDEX IF NOT EXISTS idx_stage_audit_thread ON stage_audit(thread_id);

            CREATE TABLE IF NOT EXISTS scoring_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id),
                rubric_version TEXT NOT NULL,
                dimensions TEXT NOT NULL DEFAULT '{}',
                flags TEXT NOT NULL DEFAULT '[]',
                raw_output TEXT NOT NULL,
                scored_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scoring_log_message ON scoring_log(message_id);
            CREATE INDEX IF NOT EXISTS idx_scoring_log_version ON scoring_log(rubric_version);
        "#,
    },
    Migration {
        version: 2,
        name: "research_and_cursors",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sender_research (
                domain TEXT PRIMARY KEY,
                domain_resolves INTEGER NOT NULL,
                website_title TEXT,
                website_description TEXT,
                credibility_markers TEXT NOT NULL DEFAULT '[]',
                social_links TEXT NOT NULL DEFAULT '{}',
                researched_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS poll_cursors (
                account_id TEXT PRIMARY KEY,
                folder TEXT NOT NULL DEFAULT 'INBOX',
                last_seen_uid INTEGER NOT NULL DEFAULT 0,
                last_poll_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "messages",
            "stage_audit",
            "scoring_log",
            "sender_research",
            "poll_cursors",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn require_send<F: std::future::Future + Send>(fut: F) -> F {
            fut
        }
        let conn = test_conn().await;
        require_send(run_migrations(&conn)).await.unwrap();
        assert!(get_current_version(&conn).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let row1 = rows.next().await.unwrap().unwrap();
        assert_eq!(row1.get::<i64>(0).unwrap(), 1);
        assert_eq!(row1.get::<String>(1).unwrap(), "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        assert_eq!(row2.get::<i64>(0).unwrap(), 2);
        assert_eq!(row2.get::<String>(1).unwrap(), "research_and_cursors");
    }

    #[tokio::test]
    async fn message_id_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let insert = "INSERT INTO messages (account_id, message_id, from_email, from_domain, to_email, received_at, fetched_at) VALUES ('a', 'm1', 'x@y.com', 'y.com', 'me@z.com', '2026-01-01', '2026-01-01')";
        conn.execute(insert, ()).await.unwrap();
        assert!(conn.execute(insert, ()).await.is_err());
    }
}
