//! Job Manager — orchestrates the job state machine and Ask/Answer
//! bookkeeping.
//!
//! Every write validates the current state and performs the update through a
//! compare-and-swap on `state_version`, so concurrent `cancel` vs
//! `record_answer` cannot silently corrupt the state machine. Audit events
//! and bus emissions happen inside the same call.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{
    now_ms, Answer, AnswerPayload, AnswerStatus, Ask, AskId, AskPayload, AskStatus, Job, JobId,
    JobSpec, JobState, JobStatus, ReasonCode,
};
use crate::error::{AskError, DatabaseError, Error, JobError, Result};
use crate::events::{EventBus, RelayEvent};
use crate::store::{JobFilter, Storage};

/// Bounded retries for CAS races; contention here is worker-count bounded.
const MAX_CAS_RETRIES: u32 = 5;

/// Outcome of a cancellation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancelOutcome {
    pub ok: bool,
    pub state: JobState,
}

/// A page of jobs plus pagination totals.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: i64,
    pub has_more: bool,
}

/// Orchestrates job lifecycle, asks, and answers over the storage kernel.
pub struct JobManager {
    store: Arc<dyn Storage>,
    bus: EventBus,
}

impl JobManager {
    pub fn new(store: Arc<dyn Storage>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Submit a job. Idempotent: while a prior job with the same
    /// idempotency key is non-terminal, its id is returned unchanged.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        spec.validate().map_err(|errors| {
            Error::Job(JobError::InvalidSpec(
                crate::domain::spec::join_field_errors(&errors),
            ))
        })?;

        if let Some(existing) = self
            .store
            .get_job_by_idempotency_key(&spec.idempotency_key)
            .await
            .map_err(Error::Database)?
        {
            if !existing.state.is_terminal() {
                debug!(job_id = %existing.id, key = %spec.idempotency_key, "Idempotent resubmission");
                return Ok(existing.id);
            }
        }

        let job = Job {
            id: JobId::generate(),
            idempotency_key: spec.idempotency_key.clone(),
            state: JobState::Queued,
            state_version: 0,
            priority: spec.execution.priority,
            created_at: now_ms(),
            started_at: None,
            finished_at: None,
            ttl_s: spec.execution.ttl_s as i64,
            heartbeat_at: None,
            lease_owner: None,
            lease_expires_at: None,
            attempt: 0,
            spec,
            summary: None,
            reason_code: None,
        };

        match self.store.create_job(&job).await {
            Ok(()) => {}
            // A concurrent submit with the same key won the partial unique
            // index; fall back to reading the winner.
            Err(DatabaseError::Constraint(_)) => {
                if let Some(existing) = self
                    .store
                    .get_job_by_idempotency_key(&job.idempotency_key)
                    .await
                    .map_err(Error::Database)?
                {
                    if !existing.state.is_terminal() {
                        return Ok(existing.id);
                    }
                }
                return Err(Error::Database(DatabaseError::Constraint(format!(
                    "idempotency key {} raced and no open job found",
                    job.idempotency_key
                ))));
            }
            Err(e) => return Err(Error::Database(e)),
        }

        self.store
            .append_event(
                &job.id,
                "job.submitted",
                &json!({
                    "idempotencyKey": job.idempotency_key,
                    "priority": job.priority.to_string(),
                }),
            )
            .await
            .map_err(Error::Database)?;
        self.bus.publish(RelayEvent::JobStateChanged {
            job_id: job.id.clone(),
            state: JobState::Queued,
            state_version: 0,
            summary: None,
        });

        info!(job_id = %job.id, priority = %job.priority, "Job submitted");
        Ok(job.id)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await.map_err(Error::Database)
    }

    /// Read-through status view with computed duration and PR pointer.
    pub async fn get_status(&self, id: &JobId) -> Result<Option<JobStatus>> {
        let Some(job) = self.store.get_job(id).await.map_err(Error::Database)? else {
            return Ok(None);
        };
        let mut status = JobStatus::from_job(&job);
        if let Some(pr) = self
            .store
            .get_artifact(id, crate::domain::ArtifactKind::PrJson)
            .await
            .map_err(Error::Database)?
        {
            status.pr = Some(json!({"uri": pr.uri, "digest": pr.digest}));
        }
        Ok(Some(status))
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        limit: u32,
        offset: u32,
    ) -> Result<JobPage> {
        let items = self
            .store
            .list_jobs(&JobFilter {
                state,
                limit,
                offset,
            })
            .await
            .map_err(Error::Database)?;
        let total = self.store.count_jobs(state).await.map_err(Error::Database)?;
        let has_more = (offset as i64 + items.len() as i64) < total;
        Ok(JobPage {
            items,
            total,
            has_more,
        })
    }

    /// Cancel a job. Terminal jobs report `{ok: false, state}` untouched.
    pub async fn cancel(&self, id: &JobId) -> Result<CancelOutcome> {
        let job = self
            .store
            .get_job(id)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::Job(JobError::NotFound {
                    id: id.as_str().into(),
                })
            })?;

        if job.state.is_terminal() {
            return Ok(CancelOutcome {
                ok: false,
                state: job.state,
            });
        }

        let job = self
            .update_state(id, JobState::Canceled, None, Some("Canceled by user"))
            .await?;
        Ok(CancelOutcome {
            ok: true,
            state: job.state,
        })
    }

    /// Transition a job, guarded by the state table and a CAS loop.
    pub async fn update_state(
        &self,
        id: &JobId,
        to: JobState,
        reason_code: Option<ReasonCode>,
        summary: Option<&str>,
    ) -> Result<Job> {
        for _ in 0..MAX_CAS_RETRIES {
            let job = self
                .store
                .get_job(id)
                .await
                .map_err(Error::Database)?
                .ok_or_else(|| {
                    Error::Job(JobError::NotFound {
                        id: id.as_str().into(),
                    })
                })?;

            if !job.state.can_transition_to(to) {
                return Err(Error::Job(JobError::InvalidTransition {
                    id: id.as_str().into(),
                    state: job.state.to_string(),
                    target: to.to_string(),
                }));
            }

            let won = self
                .store
                .update_job_state(id, job.state_version, to, reason_code, summary)
                .await
                .map_err(Error::Database)?;
            if !won {
                continue;
            }

            let new_version = job.state_version + 1;
            self.store
                .append_event(
                    id,
                    &format!("job.state.{}", to.to_string().to_lowercase()),
                    &json!({
                        "from": job.state.to_string(),
                        "to": to.to_string(),
                        "stateVersion": new_version,
                    }),
                )
                .await
                .map_err(Error::Database)?;
            self.bus.publish(RelayEvent::JobStateChanged {
                job_id: id.clone(),
                state: to,
                state_version: new_version,
                summary: summary.map(|s| s.to_string()),
            });

            info!(job_id = %id, from = %job.state, to = %to, "Job state changed");
            return self
                .store
                .get_job(id)
                .await
                .map_err(Error::Database)?
                .ok_or_else(|| {
                    Error::Job(JobError::NotFound {
                        id: id.as_str().into(),
                    })
                });
        }
        Err(Error::Job(JobError::VersionRace {
            id: id.as_str().into(),
        }))
    }

    /// Record a failure: audit `job.failed`, then transition to FAILED.
    pub async fn fail_job(
        &self,
        id: &JobId,
        reason_code: ReasonCode,
        message: &str,
    ) -> Result<Job> {
        self.store
            .append_event(
                id,
                "job.failed",
                &json!({"reasonCode": reason_code.as_str(), "message": message}),
            )
            .await
            .map_err(Error::Database)?;
        self.update_state(id, JobState::Failed, Some(reason_code), Some(message))
            .await
    }

    // ── Ask / Answer ────────────────────────────────────────────────

    /// Store an Ask and move its job to WAITING_ON_ANSWER.
    pub async fn create_ask(&self, payload: AskPayload) -> Result<Ask> {
        payload.validate().map_err(Error::Ask)?;

        let job = self
            .store
            .get_job(&payload.job_id)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::Ask(AskError::JobNotRunning {
                    job_id: payload.job_id.as_str().into(),
                    state: "missing".into(),
                })
            })?;
        if job.state != JobState::Running {
            return Err(Error::Ask(AskError::JobNotRunning {
                job_id: job.id.as_str().into(),
                state: job.state.to_string(),
            }));
        }

        let ask = Ask {
            ask_id: payload.ask_id.unwrap_or_else(AskId::generate),
            job_id: payload.job_id,
            step_id: payload.step_id,
            ask_type: payload.ask_type,
            prompt: payload.prompt,
            context_envelope: payload.context_envelope,
            context_hash: payload.context_hash,
            constraints: payload.constraints,
            role_id: payload.role_id,
            meta: payload.meta,
            created_at: now_ms(),
            status: AskStatus::Pending,
        };

        self.update_state(&ask.job_id, JobState::WaitingOnAnswer, None, None)
            .await?;

        if let Err(e) = self.store.insert_ask(&ask).await {
            // Undo the transition so the job is not stranded waiting.
            if let Err(undo) = self
                .update_state(&ask.job_id, JobState::Running, None, None)
                .await
            {
                warn!(job_id = %ask.job_id, error = %undo, "Failed to undo WAITING_ON_ANSWER");
            }
            return match e {
                DatabaseError::Constraint(_) => Err(Error::Ask(AskError::AlreadyOpen {
                    job_id: ask.job_id.as_str().into(),
                    step_id: ask.step_id,
                })),
                other => Err(Error::Database(other)),
            };
        }

        self.store
            .append_event(
                &ask.job_id,
                "ask.created",
                &json!({
                    "askId": ask.ask_id,
                    "stepId": ask.step_id,
                    "askType": ask.ask_type.as_str(),
                    "contextHash": ask.context_hash,
                }),
            )
            .await
            .map_err(Error::Database)?;
        self.bus.publish(RelayEvent::AskCreated { ask: ask.clone() });

        info!(ask_id = %ask.ask_id, job_id = %ask.job_id, ask_type = %ask.ask_type, "Ask created");
        Ok(ask)
    }

    /// Record an Answer, settle its Ask, and transition the job.
    pub async fn record_answer(&self, payload: AnswerPayload) -> Result<Answer> {
        payload.validate().map_err(Error::Ask)?;

        let ask = self
            .store
            .get_ask(&payload.ask_id)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| {
                Error::Ask(AskError::NotFound {
                    id: payload.ask_id.as_str().into(),
                })
            })?;

        let answer = payload.into_answer(now_ms());
        self.store
            .upsert_answer(&answer)
            .await
            .map_err(Error::Database)?;
        self.store
            .set_ask_status(&ask.ask_id, answer.status.ask_status())
            .await
            .map_err(Error::Database)?;

        self.store
            .append_event(
                &answer.job_id,
                "answer.recorded",
                &json!({
                    "askId": answer.ask_id,
                    "stepId": answer.step_id,
                    "status": answer.status.as_str(),
                }),
            )
            .await
            .map_err(Error::Database)?;
        self.bus.publish(RelayEvent::AnswerRecorded {
            answer: answer.clone(),
        });

        let transition = match answer.status {
            AnswerStatus::Answered => self
                .update_state(&answer.job_id, JobState::Running, None, None)
                .await
                .map(|_| ()),
            AnswerStatus::Rejected => {
                let summary = answer
                    .answer_text
                    .clone()
                    .or_else(|| answer.error.clone())
                    .unwrap_or_else(|| "Rejected".to_string());
                self.fail_job(&answer.job_id, ReasonCode::Policy, &summary)
                    .await
                    .map(|_| ())
            }
            AnswerStatus::Timeout => self
                .fail_job(&answer.job_id, ReasonCode::Timeout, "Ask timed out")
                .await
                .map(|_| ()),
            AnswerStatus::Error => {
                let message = answer
                    .error
                    .clone()
                    .unwrap_or_else(|| "Executor error".to_string());
                self.fail_job(&answer.job_id, ReasonCode::ExecutorError, &message)
                    .await
                    .map(|_| ())
            }
        };
        // A job canceled while the answer was in flight makes the transition
        // illegal; the answer itself is still recorded.
        if let Err(e) = transition {
            warn!(job_id = %answer.job_id, error = %e, "Post-answer transition skipped");
        }

        info!(ask_id = %answer.ask_id, status = answer.status.as_str(), "Answer recorded");
        Ok(answer)
    }

}

// ── Janitor ─────────────────────────────────────────────────────────

/// Spawn the maintenance loop: TTL expiry, stale leases, ask timeouts, and
/// decision-cache purging.
pub fn spawn_janitor(
    manager: Arc<JobManager>,
    config: &Config,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = config.janitor_interval;
    let ask_default_timeout = config.runner.default_timeout;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = janitor_sweep(&manager, ask_default_timeout).await {
                        warn!(error = %e, "Janitor sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Janitor stopping");
                    break;
                }
            }
        }
    })
}

async fn janitor_sweep(manager: &JobManager, ask_default_timeout: Duration) -> Result<()> {
    let now = now_ms();
    let store = manager.store();

    // Jobs past their TTL expire regardless of what they were doing.
    for job in store.find_ttl_exceeded(now).await.map_err(Error::Database)? {
        match manager
            .update_state(
                &job.id,
                JobState::Expired,
                Some(ReasonCode::Timeout),
                Some("TTL exceeded"),
            )
            .await
        {
            Ok(_) => info!(job_id = %job.id, "Job expired"),
            Err(e) => debug!(job_id = %job.id, error = %e, "Expiry transition skipped"),
        }
    }

    // Running jobs whose lease lapsed become reclaimable.
    for job in store.find_lease_expired(now).await.map_err(Error::Database)? {
        if job.state != JobState::Running {
            continue;
        }
        match manager
            .update_state(&job.id, JobState::Stale, None, Some("Lease expired"))
            .await
        {
            Ok(_) => info!(job_id = %job.id, "Job went stale"),
            Err(e) => debug!(job_id = %job.id, error = %e, "Stale transition skipped"),
        }
    }

    // Pending asks past their timeout get a TIMEOUT answer.
    for ask in store.list_pending_asks().await.map_err(Error::Database)? {
        let timeout_ms = ask
            .constraints
            .as_ref()
            .and_then(|c| c.timeout_s)
            .map(|s| s * 1000)
            .unwrap_or(ask_default_timeout.as_millis() as u64) as i64;
        if ask.created_at + timeout_ms < now {
            let payload = AnswerPayload {
                kind: "Answer".into(),
                ask_id: ask.ask_id.clone(),
                job_id: ask.job_id.clone(),
                step_id: ask.step_id.clone(),
                status: AnswerStatus::Timeout,
                answer_text: None,
                answer_json: None,
                attestation: None,
                artifacts: None,
                policy_trace: None,
                cacheable: Some(false),
                ask_back: None,
                error: None,
            };
            if let Err(e) = manager.record_answer(payload).await {
                warn!(ask_id = %ask.ask_id, error = %e, "Ask timeout recording failed");
            } else {
                info!(ask_id = %ask.ask_id, "Ask timed out");
            }
        }
    }

    let purged = store
        .decision_cache_purge_expired(now)
        .await
        .map_err(Error::Database)?;
    if purged > 0 {
        debug!(purged, "Decision cache purged");
    }

    Ok(())
}
