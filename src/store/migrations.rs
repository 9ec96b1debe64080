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
        name: "outreach_core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                keywords TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                leads_found INTEGER NOT NULL DEFAULT 0,
                leads_valid INTEGER NOT NULL DEFAULT 0,
                leads_enriched INTEGER NOT NULL DEFAULT 0,
                leads_emailed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_created ON campaigns(created_at);

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                state TEXT NOT NULL DEFAULT 'COLLECTED',
                email TEXT NOT NULL,
                is_valid INTEGER NOT NULL DEFAULT 0,
                contact TEXT NOT NULL,
                enrichment TEXT,
                emails_sent_count INTEGER NOT NULL DEFAULT 0,
                first_emailed_at TEXT,
                last_emailed_at TEXT,
                enriched_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_state ON leads(state);
            CREATE INDEX IF NOT EXISTS idx_leads_campaign ON leads(campaign_id);
            CREATE INDEX IF NOT EXISTS idx_leads_first_emailed ON leads(state, first_emailed_at);

            CREATE TABLE IF NOT EXISTS email_threads (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL UNIQUE REFERENCES leads(id) ON DELETE CASCADE,
                subject TEXT NOT NULL,
                thread_key TEXT NOT NULL,
                has_reply INTEGER NOT NULL DEFAULT 0,
                requires_human INTEGER NOT NULL DEFAULT 0,
                reply_sentiment TEXT,
                last_checked_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS thread_messages (
                thread_id TEXT NOT NULL REFERENCES email_threads(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                external_id TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_thread_messages_external
                ON thread_messages(thread_id, external_id);
        "#,
    },
    Migration {
        version: 2,
        name: "send_ledger_and_job_runs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS outbound_sends (
                id TEXT PRIMARY KEY,
                lead_id TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'claimed',
                subject TEXT,
                body TEXT,
                message_id TEXT,
                claimed_at TEXT NOT NULL,
                sent_at TEXT,
                UNIQUE (lead_id, kind)
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_status ON outbound_sends(status);
            CREATE INDEX IF NOT EXISTS idx_outbound_sent_at ON outbound_sends(sent_at);

            CREATE TABLE IF NOT EXISTS job_runs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                trigger TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',
                started_at TEXT NOT NULL,
                completed_at TEXT,
                candidates INTEGER NOT NULL DEFAULT 0,
                advanced INTEGER NOT NULL DEFAULT 0,
                unchanged INTEGER NOT NULL DEFAULT 0,
                deferred INTEGER NOT NULL DEFAULT 0,
                conflicts INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                result_summary TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_job_runs_kind ON job_runs(kind, started_at);
            CREATE INDEX IF NOT EXISTS idx_job_runs_status ON job_runs(status);
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

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

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

        for table in [
            "campaigns",
            "leads",
            "email_threads",
            "thread_messages",
            "outbound_sends",
            "job_runs",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
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
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "outreach_core");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "send_ledger_and_job_runs");
    }

    #[tokio::test]
    async fn ledger_rejects_second_claim_for_same_kind() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute_batch(
            "INSERT INTO campaigns (id, keywords, created_at, updated_at)
                VALUES ('c1', 'cto', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO leads (id, campaign_id, email, contact, created_at, updated_at)
                VALUES ('l1', 'c1', 'a@b.c', '{}', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z');
             INSERT INTO outbound_sends (id, lead_id, kind, claimed_at)
                VALUES ('o1', 'l1', 'first', '2026-01-01T00:00:00Z');",
        )
        .await
        .unwrap();

        let dup = conn
            .execute(
                "INSERT INTO outbound_sends (id, lead_id, kind, claimed_at)
                    VALUES ('o2', 'l1', 'first', '2026-01-01T00:00:00Z')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
