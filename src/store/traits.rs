//! Unified `Storage` trait — single async interface for all persistence.
//!
//! The storage kernel exclusively owns the persisted rows; every other
//! component reads and writes through this trait. Atomicity contracts
//! (lease acquisition, CAS state writes) are part of the trait's semantics,
//! not the caller's.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{
    Answer, ArtifactKind, ArtifactMeta, Ask, AskId, AskStatus, DecisionCacheEntry, Event, Job,
    JobId, JobState, LeaseOwner, ReasonCode,
};
use crate::error::DatabaseError;

/// Filter and pagination for `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: u32,
    pub offset: u32,
}

/// One entry of a job's ask/answer history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AskWithAnswer {
    pub ask: Ask,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
}

/// Backend-agnostic persistence trait for jobs, asks, answers, events,
/// artifacts, and the decision cache.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Initialize the schema (run migrations idempotently).
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job row (state QUEUED, state_version 0).
    async fn create_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by id.
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, DatabaseError>;

    /// Get the most recent job carrying the given idempotency key.
    async fn get_job_by_idempotency_key(&self, key: &str)
        -> Result<Option<Job>, DatabaseError>;

    /// List jobs ordered by `priority ASC, created_at ASC`.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// Count jobs matching the state filter.
    async fn count_jobs(&self, state: Option<JobState>) -> Result<i64, DatabaseError>;

    /// Compare-and-swap state write.
    ///
    /// Bumps `state_version`, sets `finished_at` iff the new state is
    /// terminal, and clears the lease when the new state cannot hold one.
    /// Returns `false` when `expected_version` lost the race (no write).
    async fn update_job_state(
        &self,
        id: &JobId,
        expected_version: i64,
        state: JobState,
        reason_code: Option<ReasonCode>,
        summary: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Atomically claim the oldest dispatchable QUEUED job.
    ///
    /// Serializable against concurrent callers and against cancellation:
    /// two workers can never win the same job. Returns the claimed id, or
    /// `None` when the queue is empty.
    async fn acquire_lease(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
    ) -> Result<Option<JobId>, DatabaseError>;

    /// Atomically claim the oldest STALE job (lease expired mid-flight).
    async fn reclaim_stale(
        &self,
        owner: &LeaseOwner,
        lease_ttl_ms: i64,
    ) -> Result<Option<JobId>, DatabaseError>;

    /// Renew a held lease. Returns `false` unless `(id, owner)` match and
    /// the job is still in a lease-holding state.
    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &LeaseOwner,
        ttl_ms: i64,
    ) -> Result<bool, DatabaseError>;

    /// Best-effort lease release.
    async fn release_lease(&self, id: &JobId, owner: &LeaseOwner) -> Result<(), DatabaseError>;

    /// Jobs holding a lease that expired before `now_ms`.
    async fn find_lease_expired(&self, now_ms: i64) -> Result<Vec<Job>, DatabaseError>;

    /// Non-terminal jobs whose TTL elapsed before `now_ms`.
    async fn find_ttl_exceeded(&self, now_ms: i64) -> Result<Vec<Job>, DatabaseError>;

    // ── Asks ────────────────────────────────────────────────────────

    /// Insert an Ask. Fails on a second open ask for the same
    /// `(job_id, step_id)`.
    async fn insert_ask(&self, ask: &Ask) -> Result<(), DatabaseError>;

    async fn get_ask(&self, id: &AskId) -> Result<Option<Ask>, DatabaseError>;

    async fn set_ask_status(&self, id: &AskId, status: AskStatus) -> Result<(), DatabaseError>;

    /// All asks for a job, oldest first, each with its answer if recorded.
    async fn list_asks_for_job(
        &self,
        job_id: &JobId,
    ) -> Result<Vec<AskWithAnswer>, DatabaseError>;

    /// All PENDING asks across jobs (janitor input).
    async fn list_pending_asks(&self) -> Result<Vec<Ask>, DatabaseError>;

    // ── Answers ─────────────────────────────────────────────────────

    /// Insert-or-replace the answer for its ask (upsert on `ask_id`).
    async fn upsert_answer(&self, answer: &Answer) -> Result<(), DatabaseError>;

    async fn get_answer(&self, ask_id: &AskId) -> Result<Option<Answer>, DatabaseError>;

    // ── Events ──────────────────────────────────────────────────────

    /// Append an audit event.
    async fn append_event(
        &self,
        job_id: &JobId,
        event_type: &str,
        payload: &Value,
    ) -> Result<(), DatabaseError>;

    /// Events for a job in append order.
    async fn list_events(&self, job_id: &JobId, limit: u32) -> Result<Vec<Event>, DatabaseError>;

    // ── Artifacts ───────────────────────────────────────────────────

    /// Record artifact metadata, replacing any prior row for the kind.
    async fn upsert_artifact(&self, meta: &ArtifactMeta) -> Result<(), DatabaseError>;

    async fn get_artifact(
        &self,
        job_id: &JobId,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactMeta>, DatabaseError>;

    async fn list_artifacts(&self, job_id: &JobId) -> Result<Vec<ArtifactMeta>, DatabaseError>;

    // ── Decision cache ──────────────────────────────────────────────

    async fn decision_cache_get(
        &self,
        key: &str,
    ) -> Result<Option<DecisionCacheEntry>, DatabaseError>;

    /// Insert-or-replace; last write wins.
    async fn decision_cache_upsert(&self, entry: &DecisionCacheEntry)
        -> Result<(), DatabaseError>;

    /// Delete expired entries, returning how many were removed.
    async fn decision_cache_purge_expired(&self, now_ms: i64) -> Result<usize, DatabaseError>;
}
