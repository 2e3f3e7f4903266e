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
        name: "core_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'QUEUED',
                state_version INTEGER NOT NULL DEFAULT 0,
                priority INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                ttl_s INTEGER NOT NULL,
                heartbeat_at INTEGER,
                lease_owner TEXT,
                lease_expires_at INTEGER,
                attempt INTEGER NOT NULL DEFAULT 0,
                spec TEXT NOT NULL,
                summary TEXT,
                reason_code TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_dispatch ON jobs(state, priority, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_open_idempotency
                ON jobs(idempotency_key)
                WHERE state IN ('QUEUED', 'RUNNING', 'WAITING_ON_ANSWER', 'STALE');
            CREATE INDEX IF NOT EXISTS idx_jobs_lease_expiry
                ON jobs(lease_expires_at) WHERE lease_expires_at IS NOT NULL;

            CREATE TABLE IF NOT EXISTS asks (
                ask_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                step_id TEXT NOT NULL,
                ask_type TEXT NOT NULL,
                prompt TEXT NOT NULL,
                context_envelope TEXT NOT NULL,
                context_hash TEXT NOT NULL,
                constraints TEXT,
                role_id TEXT,
                meta TEXT,
                created_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
            );
            CREATE INDEX IF NOT EXISTS idx_asks_job ON asks(job_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_asks_open_step
                ON asks(job_id, step_id) WHERE status = 'PENDING';

            CREATE TABLE IF NOT EXISTS answers (
                ask_id TEXT PRIMARY KEY REFERENCES asks(ask_id) ON DELETE CASCADE,
                job_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                status TEXT NOT NULL,
                answer_text TEXT,
                answer_json TEXT,
                attestation TEXT,
                artifacts TEXT,
                policy_trace TEXT,
                cacheable INTEGER NOT NULL DEFAULT 1,
                ask_back TEXT,
                error TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_answers_job ON answers(job_id);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                ts INTEGER NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_job_ts ON events(job_id, ts);
        "#,
    },
    Migration {
        version: 2,
        name: "decision_cache_and_artifacts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS decision_cache (
                decision_key TEXT PRIMARY KEY,
                answer_json TEXT,
                answer_text TEXT,
                policy_trace TEXT,
                created_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS artifacts (
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                uri TEXT NOT NULL,
                digest TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (job_id, kind)
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
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Failed to record migration V{}: {e}",
                    migration.version
                ))
            })?;
        }
    }

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
