//! libSQL backend — async `Storage` trait implementation.
//!
//! Supports local file databases (WAL-journaled) and in-memory databases
//! for `--storage memory` and tests. All atomic contracts are realized as
//! single guarded SQL statements; SQLite executes each statement atomically,
//! so no two workers can win the same lease and CAS writes cannot interleave.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{params, Connection, Database as LibSqlDatabase, Row};
use serde_json::Value;
use tracing::info;

use crate::domain::{
    now_ms, Answer, AnswerStatus, ArtifactKind, ArtifactMeta, Ask, AskConstraints, AskId,
    AskStatus, AskType, DecisionCacheEntry, Event, Job, JobId, JobState, LeaseOwner, Priority,
    ReasonCode,
};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{AskWithAnswer, JobFilter, Storage};

/// libSQL storage kernel.
///
/// Holds a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file, enable WAL, run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let _ = conn.query("PRAGMA journal_mode = WAL", ()).await;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for `--storage memory` and tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(msg)
    } else {
        DatabaseError::Query(msg)
    }
}

fn json_col<T: serde::de::DeserializeOwned>(
    raw: Option<String>,
    what: &str,
) -> Result<Option<T>, DatabaseError> {
    match raw {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}"))),
        None => Ok(None),
    }
}

fn to_json_col<T: serde::Serialize>(
    value: &Option<T>,
    what: &str,
) -> Result<Option<String>, DatabaseError> {
    match value {
        Some(v) => serde_json::to_string(v)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}"))),
        None => Ok(None),
    }
}

/// Map a jobs row. Column order matches `JOB_COLUMNS`.
fn row_to_job(row: &Row) -> Result<Job, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let idempotency_key: String = row.get(1).map_err(query_err)?;
    let state_str: String = row.get(2).map_err(query_err)?;
    let state_version: i64 = row.get(3).map_err(query_err)?;
    let priority: i64 = row.get(4).map_err(query_err)?;
    let created_at: i64 = row.get(5).map_err(query_err)?;
    let started_at: Option<i64> = row.get(6).ok();
    let finished_at: Option<i64> = row.get(7).ok();
    let ttl_s: i64 = row.get(8).map_err(query_err)?;
    let heartbeat_at: Option<i64> = row.get(9).ok();
    let lease_owner: Option<String> = row.get(10).ok();
    let lease_expires_at: Option<i64> = row.get(11).ok();
    let attempt: i64 = row.get(12).map_err(query_err)?;
    let spec_str: String = row.get(13).map_err(query_err)?;
    let summary: Option<String> = row.get(14).ok();
    let reason_str: Option<String> = row.get(15).ok();

    let state: JobState = state_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(e))?;
    let spec = serde_json::from_str(&spec_str)
        .map_err(|e| DatabaseError::Serialization(format!("job spec: {e}")))?;
    let reason_code = match reason_str {
        Some(s) => Some(
            s.parse::<ReasonCode>()
                .map_err(DatabaseError::Serialization)?,
        ),
        None => None,
    };

    Ok(Job {
        id: JobId::new(id),
        idempotency_key,
        state,
        state_version,
        priority: Priority::from_rank(priority),
        created_at,
        started_at,
        finished_at,
        ttl_s,
        heartbeat_at,
        lease_owner: lease_owner.map(LeaseOwner::new),
        lease_expires_at,
        attempt: attempt as u32,
        spec,
        summary,
        reason_code,
    })
}

const JOB_COLUMNS: &str = "id, idempotency_key, state, state_version, priority, created_at, \
     started_at, finished_at, ttl_s, heartbeat_at, lease_owner, lease_expires_at, \
     attempt, spec, summary, reason_code";

/// Map an asks row. Column order matches `ASK_COLUMNS`.
fn row_to_ask(row: &Row) -> Result<Ask, DatabaseError> {
    let ask_id: String = row.get(0).map_err(query_err)?;
    let job_id: String = row.get(1).map_err(query_err)?;
    let step_id: String = row.get(2).map_err(query_err)?;
    let ask_type_str: String = row.get(3).map_err(query_err)?;
    let prompt: String = row.get(4).map_err(query_err)?;
    let envelope_str: String = row.get(5).map_err(query_err)?;
    let context_hash: String = row.get(6).map_err(query_err)?;
    let constraints_str: Option<String> = row.get(7).ok();
    let role_id: Option<String> = row.get(8).ok();
    let meta_str: Option<String> = row.get(9).ok();
    let created_at: i64 = row.get(10).map_err(query_err)?;
    let status_str: String = row.get(11).map_err(query_err)?;

    let ask_type: AskType = ask_type_str
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let status: AskStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let context_envelope: Value = serde_json::from_str(&envelope_str)
        .map_err(|e| DatabaseError::Serialization(format!("ask envelope: {e}")))?;
    let constraints: Option<AskConstraints> = json_col(constraints_str, "ask constraints")?;
    let meta: Option<Value> = json_col(meta_str, "ask meta")?;

    Ok(Ask {
        ask_id: AskId::new(ask_id),
        job_id: JobId::new(job_id),
        step_id,
        ask_type,
        prompt,
        context_envelope,
        context_hash,
        constraints,
        role_id,
        meta,
        created_at,
        status,
    })
}

const ASK_COLUMNS: &str = "ask_id, job_id, step_id, ask_type, prompt, context_envelope, \
     context_hash, constraints, role_id, meta, created_at, status";

/// Map an answers row. Column order matches `ANSWER_COLUMNS`.
fn row_to_answer(row: &Row) -> Result<Answer, DatabaseError> {
    let ask_id: String = row.get(0).map_err(query_err)?;
    let job_id: String = row.get(1).map_err(query_err)?;
    let step_id: String = row.get(2).map_err(query_err)?;
    let status_str: String = row.get(3).map_err(query_err)?;
    let answer_text: Option<String> = row.get(4).ok();
    let answer_json_str: Option<String> = row.get(5).ok();
    let attestation_str: Option<String> = row.get(6).ok();
    let artifacts_str: Option<String> = row.get(7).ok();
    let policy_trace_str: Option<String> = row.get(8).ok();
    let cacheable: i64 = row.get(9).map_err(query_err)?;
    let ask_back: Option<String> = row.get(10).ok();
    let error: Option<String> = row.get(11).ok();
    let created_at: i64 = row.get(12).map_err(query_err)?;

    let status: AnswerStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(Answer {
        ask_id: AskId::new(ask_id),
        job_id: JobId::new(job_id),
        step_id,
        status,
        answer_text,
        answer_json: json_col(answer_json_str, "answer json")?,
        attestation: json_col(attestation_str, "attestation")?,
        artifacts: json_col(artifacts_str, "answer artifacts")?,
        policy_trace: json_col(policy_trace_str, "policy trace")?,
        cacheable: cacheable != 0,
        ask_back,
        error,
        created_at,
    })
}

const ANSWER_COLUMNS: &str = "ask_id, job_id, step_id, status, answer_text, answer_json, \
     attestation, artifacts, policy_trace, cacheable, ask_back, error, created_at";

#[async_trait]
impl Storage for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let spec = serde_json::to_string(&job.spec)
            .map_err(|e| DatabaseError::Serialization(format!("job spec: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO jobs (id, idempotency_key, state, state_version, priority, \
                 created_at, ttl_s, attempt, spec) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.id.as_str(),
                    job.idempotency_key.as_str(),
                    job.state.to_string(),
                    job.state_version,
                    job.priority.rank(),
                    job.created_at,
                    job.ttl_s,
                    job.attempt as i64,
                    spec
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.as_str()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_job_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                params![key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError> {
        let limit = filter.limit as i64;
        let offset = filter.offset as i64;
        let mut rows = match filter.state {
            Some(state) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 \
                         ORDER BY priority ASC, created_at ASC LIMIT ?2 OFFSET ?3"
                    ),
                    params![state.to_string(), limit, offset],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs \
                         ORDER BY priority ASC, created_at ASC LIMIT ?1 OFFSET ?2"
                    ),
                    params![limit, offset],
                )
                .await
                .map_err(query_err)?,
        };

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn count_jobs(&self, state: Option<JobState>) -> Result<i64, DatabaseError> {
        let mut rows = match state {
            Some(state) => self
                .conn()
                .query(
                    "SELECT COUNT(*) FROM jobs WHERE state = ?1",
                    params![state.to_string()],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn()
                .query("SELECT COUNT(*) FROM jobs", ())
                .await
                .map_err(query_err)?,
        };
        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| DatabaseError::Query("COUNT returned no row".into()))?;
        row.get(0).map_err(query_err)
    }

    async fn update_job_state(
        &self,
        id: &JobId,
        expected_version: i64,
        state: JobState,
        reason_code: Option<ReasonCode>,
        summary: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let is_terminal = state.is_terminal() as i64;
        let clears_lease = !state.holds_lease() as i64;
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET \
                     state = ?1, \
                     state_version = state_version + 1, \
                     reason_code = COALESCE(?2, reason_code), \
                     summary = COALESCE(?3, summary), \
                     finished_at = CASE WHEN ?4 = 1 THEN ?5 ELSE finished_at END, \
                     lease_owner = CASE WHEN ?6 = 1 THEN NULL ELSE lease_owner END, \
                     lease_expires_at = CASE WHEN ?6 = 1 THEN NULL ELSE lease_expires_at END \
                 WHERE id = ?7 AND state_version = ?8",
                params![
                    state.to_string(),
                    reason_code.map(|r| r.as_str().to_string()),
                    summary.map(|s| s.to_string()),
                    is_terminal,
                    now,
                    clears_lease,
                    id.as_str(),
                    expected_version
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn acquire_lease(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
    ) -> Result<Option<JobId>, DatabaseError> {
        let now = now_ms();
        // Single statement: SQLite executes it atomically, so concurrent
        // callers cannot claim the same row.
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET \
                     state = 'RUNNING', \
                     state_version = state_version + 1, \
                     lease_owner = ?1, \
                     lease_expires_at = ?2, \
                     started_at = COALESCE(started_at, ?3), \
                     heartbeat_at = ?3, \
                     attempt = attempt + 1 \
                 WHERE id = ( \
                     SELECT id FROM jobs \
                     WHERE state = 'QUEUED' \
                       AND (lease_expires_at IS NULL OR lease_expires_at < ?3) \
                     ORDER BY priority ASC, created_at ASC \
                     LIMIT 1 \
                 ) AND state = 'QUEUED' \
                 RETURNING id",
                params![owner.as_str(), now + lease_ttl_ms, now],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err)?;
                Ok(Some(JobId::new(id)))
            }
            None => Ok(None),
        }
    }

    async fn reclaim_stale(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
    ) -> Result<Option<JobId>, DatabaseError> {
        let now = now_ms();
        let mut rows = self
            .conn()
            .query(
                "UPDATE jobs SET \
                     state = 'RUNNING', \
                     state_version = state_version + 1, \
                     lease_owner = ?1, \
                     lease_expires_at = ?2, \
                     heartbeat_at = ?3, \
                     attempt = attempt + 1 \
                 WHERE id = ( \
                     SELECT id FROM jobs \
                     WHERE state = 'STALE' \
                       AND (lease_expires_at IS NULL OR lease_expires_at < ?3) \
                     ORDER BY priority ASC, created_at ASC \
                     LIMIT 1 \
                 ) AND state = 'STALE' \
                 RETURNING id",
                params![owner.as_str(), now + lease_ttl_ms, now],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err)?;
                Ok(Some(JobId::new(id)))
            }
            None => Ok(None),
        }
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &LeaseOwner,
        ttl_ms: i64,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET heartbeat_at = ?1, lease_expires_at = ?2 \
                 WHERE id = ?3 AND lease_owner = ?4 \
                   AND state IN ('RUNNING', 'WAITING_ON_ANSWER')",
                params![now, now + ttl_ms, id.as_str(), owner.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn release_lease(&self, id: &JobId, owner: &LeaseOwner) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL \
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id.as_str(), owner.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn find_lease_expired(&self, now_ms: i64) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE state IN ('RUNNING', 'WAITING_ON_ANSWER') \
                       AND lease_expires_at IS NOT NULL AND lease_expires_at < ?1"
                ),
                params![now_ms],
            )
            .await
            .map_err(query_err)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    async fn find_ttl_exceeded(&self, now_ms: i64) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE state IN ('QUEUED', 'RUNNING', 'WAITING_ON_ANSWER', 'STALE') \
                       AND created_at + ttl_s * 1000 < ?1"
                ),
                params![now_ms],
            )
            .await
            .map_err(query_err)?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }

    // ── Asks ────────────────────────────────────────────────────────

    async fn insert_ask(&self, ask: &Ask) -> Result<(), DatabaseError> {
        let envelope = serde_json::to_string(&ask.context_envelope)
            .map_err(|e| DatabaseError::Serialization(format!("ask envelope: {e}")))?;
        let constraints = to_json_col(&ask.constraints, "ask constraints")?;
        let meta = to_json_col(&ask.meta, "ask meta")?;
        self.conn()
            .execute(
                "INSERT INTO asks (ask_id, job_id, step_id, ask_type, prompt, \
                 context_envelope, context_hash, constraints, role_id, meta, \
                 created_at, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    ask.ask_id.as_str(),
                    ask.job_id.as_str(),
                    ask.step_id.as_str(),
                    ask.ask_type.as_str(),
                    ask.prompt.as_str(),
                    envelope,
                    ask.context_hash.as_str(),
                    constraints,
                    ask.role_id.clone(),
                    meta,
                    ask.created_at,
                    ask.status.as_str()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_ask(&self, id: &AskId) -> Result<Option<Ask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ASK_COLUMNS} FROM asks WHERE ask_id = ?1"),
                params![id.as_str()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_ask(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_ask_status(&self, id: &AskId, status: AskStatus) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE asks SET status = ?1 WHERE ask_id = ?2",
                params![status.as_str(), id.as_str()],
            )
            .await
            .map_err(query_err)?;
        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "ask".into(),
                id: id.as_str().into(),
            });
        }
        Ok(())
    }

    async fn list_asks_for_job(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<AskWithAnswer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASK_COLUMNS} FROM asks WHERE job_id = ?1 ORDER BY created_at ASC"
                ),
                params![job_id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let mut asks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            asks.push(row_to_ask(&row)?);
        }

        let mut answer_rows = self
            .conn()
            .query(
                &format!("SELECT {ANSWER_COLUMNS} FROM answers WHERE job_id = ?1"),
                params![job_id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let mut answers = std::collections::HashMap::new();
        while let Some(row) = answer_rows.next().await.map_err(query_err)? {
            let answer = row_to_answer(&row)?;
            answers.insert(answer.ask_id.clone(), answer);
        }

        Ok(asks
            .into_iter()
            .map(|ask| {
                let answer = answers.remove(&ask.ask_id);
                AskWithAnswer { ask, answer }
            })
            .collect())
    }

    async fn list_pending_asks(&self) -> Result<Vec<Ask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASK_COLUMNS} FROM asks WHERE status = 'PENDING' \
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut asks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            asks.push(row_to_ask(&row)?);
        }
        Ok(asks)
    }

    // ── Answers ─────────────────────────────────────────────────────

    async fn upsert_answer(&self, answer: &Answer) -> Result<(), DatabaseError> {
        let answer_json = to_json_col(&answer.answer_json, "answer json")?;
        let attestation = to_json_col(&answer.attestation, "attestation")?;
        let artifacts = to_json_col(&answer.artifacts, "answer artifacts")?;
        let policy_trace = to_json_col(&answer.policy_trace, "policy trace")?;
        self.conn()
            .execute(
                "INSERT INTO answers (ask_id, job_id, step_id, status, answer_text, \
                 answer_json, attestation, artifacts, policy_trace, cacheable, \
                 ask_back, error, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(ask_id) DO UPDATE SET \
                     status = excluded.status, \
                     answer_text = excluded.answer_text, \
                     answer_json = excluded.answer_json, \
                     attestation = excluded.attestation, \
                     artifacts = excluded.artifacts, \
                     policy_trace = excluded.policy_trace, \
                     cacheable = excluded.cacheable, \
                     ask_back = excluded.ask_back, \
                     error = excluded.error, \
                     created_at = excluded.created_at",
                params![
                    answer.ask_id.as_str(),
                    answer.job_id.as_str(),
                    answer.step_id.as_str(),
                    answer.status.as_str(),
                    answer.answer_text.clone(),
                    answer_json,
                    attestation,
                    artifacts,
                    policy_trace,
                    answer.cacheable as i64,
                    answer.ask_back.clone(),
                    answer.error.clone(),
                    answer.created_at
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_answer(&self, ask_id: &AskId) -> Result<Option<Answer>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ANSWER_COLUMNS} FROM answers WHERE ask_id = ?1"),
                params![ask_id.as_str()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_answer(&row)?)),
            None => Ok(None),
        }
    }

    // ── Events ──────────────────────────────────────────────────────

    async fn append_event(
        &self,
        job_id: &JobId,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(format!("event payload: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO events (job_id, ts, type, payload) VALUES (?1, ?2, ?3, ?4)",
                params![job_id.as_str(), now_ms(), event_type, payload],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_events(&self, job_id: &JobId, limit: u32) -> Result<Vec<Event>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, job_id, ts, type, payload FROM events \
                 WHERE job_id = ?1 ORDER BY ts ASC, id ASC LIMIT ?2",
                params![job_id.as_str(), limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: i64 = row.get(0).map_err(query_err)?;
            let job_id: String = row.get(1).map_err(query_err)?;
            let ts: i64 = row.get(2).map_err(query_err)?;
            let event_type: String = row.get(3).map_err(query_err)?;
            let payload_str: String = row.get(4).map_err(query_err)?;
            let payload = serde_json::from_str(&payload_str)
                .map_err(|e| DatabaseError::Serialization(format!("event payload: {e}")))?;
            events.push(Event {
                id,
                job_id: JobId::new(job_id),
                ts,
                event_type,
                payload,
            });
        }
        Ok(events)
    }

    // ── Artifacts ───────────────────────────────────────────────────

    async fn upsert_artifact(&self, meta: &ArtifactMeta) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO artifacts (job_id, kind, uri, digest, size, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(job_id, kind) DO UPDATE SET \
                     uri = excluded.uri, \
                     digest = excluded.digest, \
                     size = excluded.size, \
                     created_at = excluded.created_at",
                params![
                    meta.job_id.as_str(),
                    meta.kind.as_str(),
                    meta.uri.as_str(),
                    meta.digest.as_str(),
                    meta.size as i64,
                    meta.created_at
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_artifact(
        &self,
        job_id: &JobId,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactMeta>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, kind, uri, digest, size, created_at FROM artifacts \
                 WHERE job_id = ?1 AND kind = ?2",
                params![job_id.as_str(), kind.as_str()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_artifact(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_artifacts(&self, job_id: &JobId) -> Result<Vec<ArtifactMeta>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, kind, uri, digest, size, created_at FROM artifacts \
                 WHERE job_id = ?1 ORDER BY kind ASC",
                params![job_id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let mut metas = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            metas.push(row_to_artifact(&row)?);
        }
        Ok(metas)
    }

    // ── Decision cache ──────────────────────────────────────────────

    async fn decision_cache_get(
        &self,
        key: &str,
    ) -> Result<Option<DecisionCacheEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT decision_key, answer_json, answer_text, policy_trace, \
                 created_at, ttl_seconds FROM decision_cache WHERE decision_key = ?1",
                params![key],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let decision_key: String = row.get(0).map_err(query_err)?;
                let answer_json_str: Option<String> = row.get(1).ok();
                let answer_text: Option<String> = row.get(2).ok();
                let policy_trace_str: Option<String> = row.get(3).ok();
                let created_at: i64 = row.get(4).map_err(query_err)?;
                let ttl_seconds: i64 = row.get(5).map_err(query_err)?;
                Ok(Some(DecisionCacheEntry {
                    decision_key,
                    answer_json: json_col(answer_json_str, "cached answer json")?,
                    answer_text,
                    policy_trace: json_col(policy_trace_str, "cached policy trace")?,
                    created_at,
                    ttl_seconds,
                }))
            }
            None => Ok(None),
        }
    }

    async fn decision_cache_upsert(
        &self,
        entry: &DecisionCacheEntry,
    ) -> Result<(), DatabaseError> {
        let answer_json = to_json_col(&entry.answer_json, "cached answer json")?;
        let policy_trace = to_json_col(&entry.policy_trace, "cached policy trace")?;
        self.conn()
            .execute(
                "INSERT INTO decision_cache (decision_key, answer_json, answer_text, \
                 policy_trace, created_at, ttl_seconds) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(decision_key) DO UPDATE SET \
                     answer_json = excluded.answer_json, \
                     answer_text = excluded.answer_text, \
                     policy_trace = excluded.policy_trace, \
                     created_at = excluded.created_at, \
                     ttl_seconds = excluded.ttl_seconds",
                params![
                    entry.decision_key.as_str(),
                    answer_json,
                    entry.answer_text.clone(),
                    policy_trace,
                    entry.created_at,
                    entry.ttl_seconds
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn decision_cache_purge_expired(&self, now_ms: i64) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM decision_cache WHERE created_at + ttl_seconds * 1000 < ?1",
                params![now_ms],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }
}

fn row_to_artifact(row: &Row) -> Result<ArtifactMeta, DatabaseError> {
    let job_id: String = row.get(0).map_err(query_err)?;
    let kind_str: String = row.get(1).map_err(query_err)?;
    let uri: String = row.get(2).map_err(query_err)?;
    let digest: String = row.get(3).map_err(query_err)?;
    let size: i64 = row.get(4).map_err(query_err)?;
    let created_at: i64 = row.get(5).map_err(query_err)?;
    let kind: ArtifactKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    Ok(ArtifactMeta {
        job_id: JobId::new(job_id),
        kind,
        uri,
        digest,
        size: size as u64,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::tests_support::valid_spec;
    use crate::domain::stable_hash_context;
    use serde_json::json;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_job(key: &str) -> Job {
        Job {
            id: JobId::generate(),
            idempotency_key: key.into(),
            state: JobState::Queued,
            state_version: 0,
            priority: Priority::P1,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            ttl_s: 3600,
            heartbeat_at: None,
            lease_owner: None,
            lease_expires_at: None,
            attempt: 0,
            spec: valid_spec(key),
            summary: None,
            reason_code: None,
        }
    }

    fn make_ask(job_id: &JobId, step: &str) -> Ask {
        let envelope = json!({"role": "default"});
        Ask {
            ask_id: AskId::generate(),
            job_id: job_id.clone(),
            step_id: step.into(),
            ask_type: AskType::Clarification,
            prompt: "which column?".into(),
            context_hash: stable_hash_context(&envelope),
            context_envelope: envelope,
            constraints: None,
            role_id: None,
            meta: None,
            created_at: now_ms(),
            status: AskStatus::Pending,
        }
    }

    #[tokio::test]
    async fn job_roundtrip() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.state_version, 0);
        assert_eq!(loaded.spec.idempotency_key, "K1");

        let by_key = store
            .get_job_by_idempotency_key("K1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, job.id);
        assert!(store.get_job(&JobId::new("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_update_respects_version() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let won = store
            .update_job_state(&job.id, 0, JobState::Canceled, None, Some("Canceled by user"))
            .await
            .unwrap();
        assert!(won);

        // Stale version loses.
        let lost = store
            .update_job_state(&job.id, 0, JobState::Expired, None, None)
            .await
            .unwrap();
        assert!(!lost);

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Canceled);
        assert_eq!(loaded.state_version, 1);
        assert!(loaded.finished_at.is_some());
        assert_eq!(loaded.summary.as_deref(), Some("Canceled by user"));
    }

    #[tokio::test]
    async fn acquire_lease_claims_oldest_by_priority() {
        let store = backend().await;
        let mut low = make_job("K-low");
        low.priority = Priority::P2;
        let mut high = make_job("K-high");
        high.priority = Priority::P0;
        high.created_at = low.created_at + 10;
        store.create_job(&low).await.unwrap();
        store.create_job(&high).await.unwrap();

        let owner = LeaseOwner::new("worker-1");
        let first = store.acquire_lease(&owner, 60_000).await.unwrap().unwrap();
        assert_eq!(first, high.id, "P0 dispatches before P2");

        let second = store.acquire_lease(&owner, 60_000).await.unwrap().unwrap();
        assert_eq!(second, low.id);

        assert!(store.acquire_lease(&owner, 60_000).await.unwrap().is_none());

        let claimed = store.get_job(&high.id).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.state_version, 1);
        assert_eq!(claimed.attempt, 1);
        assert!(claimed.started_at.is_some());
        assert!(claimed.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn renew_lease_requires_matching_owner_and_state() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let owner = LeaseOwner::new("worker-1");
        store.acquire_lease(&owner, 60_000).await.unwrap().unwrap();

        assert!(store.renew_lease(&job.id, &owner, 60_000).await.unwrap());
        let stranger = LeaseOwner::new("worker-2");
        assert!(!store.renew_lease(&job.id, &stranger, 60_000).await.unwrap());

        // After cancellation the renewal fails, which is how workers learn.
        let current = store.get_job(&job.id).await.unwrap().unwrap();
        store
            .update_job_state(
                &job.id,
                current.state_version,
                JobState::Canceled,
                None,
                None,
            )
            .await
            .unwrap();
        assert!(!store.renew_lease(&job.id, &owner, 60_000).await.unwrap());
    }

    #[tokio::test]
    async fn reclaim_stale_picks_up_expired_job() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let owner = LeaseOwner::new("worker-1");
        store.acquire_lease(&owner, 60_000).await.unwrap().unwrap();

        let current = store.get_job(&job.id).await.unwrap().unwrap();
        store
            .update_job_state(&job.id, current.state_version, JobState::Stale, None, None)
            .await
            .unwrap();

        let other = LeaseOwner::new("worker-2");
        let reclaimed = store.reclaim_stale(&other, 60_000).await.unwrap().unwrap();
        assert_eq!(reclaimed, job.id);

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Running);
        assert_eq!(loaded.lease_owner, Some(other));
        assert_eq!(loaded.attempt, 2);
    }

    #[tokio::test]
    async fn ask_and_answer_roundtrip() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let ask = make_ask(&job.id, "s1");
        store.insert_ask(&ask).await.unwrap();

        let loaded = store.get_ask(&ask.ask_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AskStatus::Pending);
        assert_eq!(loaded.context_hash, ask.context_hash);

        // Duplicate open step rejected.
        let dup = make_ask(&job.id, "s1");
        assert!(matches!(
            store.insert_ask(&dup).await,
            Err(DatabaseError::Constraint(_))
        ));

        let answer = Answer {
            ask_id: ask.ask_id.clone(),
            job_id: job.id.clone(),
            step_id: "s1".into(),
            status: AnswerStatus::Answered,
            answer_text: Some("column list".into()),
            answer_json: Some(json!({"columns": ["id", "name"]})),
            attestation: None,
            artifacts: None,
            policy_trace: None,
            cacheable: true,
            ask_back: None,
            error: None,
            created_at: now_ms(),
        };
        store.upsert_answer(&answer).await.unwrap();
        store
            .set_ask_status(&ask.ask_id, AskStatus::Answered)
            .await
            .unwrap();

        let loaded = store.get_answer(&ask.ask_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AnswerStatus::Answered);
        assert_eq!(loaded.answer_json, Some(json!({"columns": ["id", "name"]})));

        // Upsert replaces on retry.
        let mut replacement = answer.clone();
        replacement.answer_text = Some("revised".into());
        store.upsert_answer(&replacement).await.unwrap();
        let loaded = store.get_answer(&ask.ask_id).await.unwrap().unwrap();
        assert_eq!(loaded.answer_text.as_deref(), Some("revised"));

        let history = store.list_asks_for_job(&job.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].answer.is_some());
    }

    #[tokio::test]
    async fn events_are_append_only_and_ordered() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        store
            .append_event(&job.id, "job.submitted", &json!({"key": "K1"}))
            .await
            .unwrap();
        store
            .append_event(&job.id, "job.state.running", &json!({}))
            .await
            .unwrap();

        let events = store.list_events(&job.id, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "job.submitted");
        assert_eq!(events[1].event_type, "job.state.running");
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn artifact_meta_upsert() {
        let store = backend().await;
        let job = make_job("K1");
        store.create_job(&job).await.unwrap();

        let meta = ArtifactMeta {
            job_id: job.id.clone(),
            kind: ArtifactKind::PatchDiff,
            uri: "/artifacts/j/patch.diff".into(),
            digest: "d".repeat(64),
            size: 128,
            created_at: now_ms(),
        };
        store.upsert_artifact(&meta).await.unwrap();
        store.upsert_artifact(&meta).await.unwrap();

        let listed = store.list_artifacts(&job.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 128);

        let got = store
            .get_artifact(&job.id, ArtifactKind::PatchDiff)
            .await
            .unwrap();
        assert!(got.is_some());
        assert!(store
            .get_artifact(&job.id, ArtifactKind::PrJson)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn decision_cache_lifecycle() {
        let store = backend().await;
        let entry = DecisionCacheEntry {
            decision_key: "k1".into(),
            answer_json: Some(json!({"ok": true})),
            answer_text: None,
            policy_trace: None,
            created_at: now_ms() - 100_000_000,
            ttl_seconds: 1,
        };
        store.decision_cache_upsert(&entry).await.unwrap();

        let loaded = store.decision_cache_get("k1").await.unwrap().unwrap();
        assert_eq!(loaded.answer_json, Some(json!({"ok": true})));
        assert!(loaded.is_expired(now_ms()));

        let purged = store.decision_cache_purge_expired(now_ms()).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.decision_cache_get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_jobs_filters_and_paginates() {
        let store = backend().await;
        for i in 0..5 {
            let mut job = make_job(&format!("K{i}"));
            job.created_at = now_ms() + i;
            store.create_job(&job).await.unwrap();
        }

        let all = store
            .list_jobs(&JobFilter {
                state: None,
                limit: 3,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let rest = store
            .list_jobs(&JobFilter {
                state: None,
                limit: 10,
                offset: 3,
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);

        assert_eq!(store.count_jobs(None).await.unwrap(), 5);
        assert_eq!(
            store.count_jobs(Some(JobState::Queued)).await.unwrap(),
            5
        );
        assert_eq!(store.count_jobs(Some(JobState::Failed)).await.unwrap(), 0);
    }
}
