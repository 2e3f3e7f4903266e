//! Worker pool — leases jobs, runs the executor backend, writes artifacts.
//!
//! Each worker is a cooperative tokio task: claim a lease, heartbeat it on
//! an interval, prepare the repository, invoke the backend under the job's
//! timeout, persist the three artifacts, validate the diff, and settle the
//! job. A failed lease renewal (cancellation, expiry) aborts the in-flight
//! work; the job is then either terminal already or reclaimed via STALE.

pub mod artifacts;
pub mod executor;
pub mod repo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::domain::{ArtifactKind, Job, JobId, JobState, LeaseOwner, ReasonCode};
use crate::error::ExecutorError;
use crate::manager::JobManager;
use crate::store::Storage;

pub use artifacts::ArtifactStore;
pub use executor::{CommandExecutor, ExecutorBackend, ExecutorOutput, UnconfiguredExecutor};

/// Shared dependencies for the worker pool.
#[derive(Clone)]
pub struct WorkerDeps {
    pub manager: Arc<JobManager>,
    pub executor: Arc<dyn ExecutorBackend>,
    pub artifacts: Arc<ArtifactStore>,
    pub config: WorkerConfig,
}

/// A fixed pool of `max_concurrency` workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the pool. Workers stop claiming once `shutdown` flips.
    pub fn spawn(deps: WorkerDeps, shutdown: watch::Receiver<bool>) -> Self {
        let handles = (0..deps.config.max_concurrency)
            .map(|index| {
                let worker = Worker {
                    owner: LeaseOwner::generate(index),
                    deps: deps.clone(),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker.run(shutdown).await;
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to finish.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    owner: LeaseOwner,
    deps: WorkerDeps,
}

impl Worker {
    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(owner = %self.owner, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.claim().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(owner = %self.owner, error = %e, "Lease claim failed");
                    None
                }
            };

            match claimed {
                Some(job_id) => {
                    self.run_claimed_job(&job_id, &mut shutdown).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.deps.config.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!(owner = %self.owner, "Worker stopped");
    }

    /// Claim a QUEUED job, falling back to reclaiming a STALE one.
    async fn claim(&self) -> Result<Option<JobId>, crate::error::DatabaseError> {
        let store = self.deps.manager.store();
        let ttl = self.deps.config.lease_ttl.as_millis() as i64;
        if let Some(id) = store.acquire_lease(&self.owner, ttl).await? {
            return Ok(Some(id));
        }
        store.reclaim_stale(&self.owner, ttl).await
    }

    /// Run one claimed job to completion, failure, or abort.
    async fn run_claimed_job(&self, job_id: &JobId, shutdown: &mut watch::Receiver<bool>) {
        let store = self.deps.manager.store().clone();
        let job = match store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "Claimed job vanished");
                return;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Claimed job unreadable");
                return;
            }
        };
        info!(job_id = %job_id, owner = %self.owner, attempt = job.attempt, "Job claimed");

        let (abort_tx, mut abort_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            store.clone(),
            job_id.clone(),
            self.owner.clone(),
            self.deps.config.heartbeat_interval,
            self.deps.config.lease_ttl,
            abort_tx,
        ));

        let work_dir = work_dir_for(job_id);
        let outcome = tokio::select! {
            outcome = self.process_job(&job, &work_dir) => Some(outcome),
            _ = abort_rx.changed() => {
                info!(job_id = %job_id, "Lease lost; aborting in-flight work");
                None
            }
            _ = shutdown.changed() => {
                info!(job_id = %job_id, "Shutdown; aborting in-flight work");
                None
            }
        };
        heartbeat.abort();

        match outcome {
            Some(Ok(summary)) => {
                if let Err(e) = self
                    .deps
                    .manager
                    .update_state(job_id, JobState::Succeeded, None, Some(&summary))
                    .await
                {
                    warn!(job_id = %job_id, error = %e, "Success transition failed");
                }
            }
            Some(Err((reason, message))) => {
                if let Err(e) = self.deps.manager.fail_job(job_id, reason, &message).await {
                    warn!(job_id = %job_id, error = %e, "Failure transition failed");
                }
            }
            // Lease lost: the job was canceled, went stale, or we are
            // shutting down. Leave its state to whoever owns it now.
            None => {}
        }

        if let Err(e) = store.release_lease(job_id, &self.owner).await {
            debug!(job_id = %job_id, error = %e, "Lease release failed");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(work_dir = %work_dir.display(), error = %e, "Work dir cleanup failed");
            }
        }
    }

    /// Prepare, execute, persist artifacts, validate. Returns the success
    /// summary or the mapped failure.
    async fn process_job(
        &self,
        job: &Job,
        work_dir: &std::path::Path,
    ) -> Result<String, (ReasonCode, String)> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| (ReasonCode::InternalError, format!("work dir: {e}")))?;

        let checkout = repo::prepare_repository(&job.spec.repo, work_dir)
            .await
            .map_err(|e| (map_failure(&e), e.to_string()))?;

        let timeout = Duration::from_millis(job.spec.timeout_ms());
        let output = tokio::time::timeout(
            timeout,
            self.deps.executor.execute(&job.spec, &checkout),
        )
        .await
        .map_err(|_| {
            (
                ReasonCode::Timeout,
                format!("executor exceeded {}s", timeout.as_secs()),
            )
        })?
        .map_err(|e| (map_failure(&e), e.to_string()))?;

        self.write_artifacts(&job.id, &output)
            .await
            .map_err(|e| (map_failure(&e), e.to_string()))?;

        let applies = repo::apply_check(&checkout, &output.diff)
            .await
            .map_err(|e| (map_failure(&e), e.to_string()))?;
        if !applies {
            return Err((
                ReasonCode::Conflict,
                "generated diff does not apply to the baseline".into(),
            ));
        }

        Ok(format!(
            "Produced {} byte diff with test plan and notes",
            output.diff.len()
        ))
    }

    async fn write_artifacts(
        &self,
        job_id: &JobId,
        output: &ExecutorOutput,
    ) -> Result<(), ExecutorError> {
        let store = self.deps.manager.store();

        let out_md = format!(
            "# Test Plan\n\n{}\n\n# Notes\n\n{}\n",
            output.test_plan, output.notes
        );
        for (kind, bytes) in [
            (ArtifactKind::PatchDiff, output.diff.as_bytes()),
            (ArtifactKind::OutMd, out_md.as_bytes()),
            (ArtifactKind::LogsTxt, output.raw_output.as_bytes()),
        ] {
            let meta = self.deps.artifacts.write(job_id, kind, bytes).await?;
            store
                .upsert_artifact(&meta)
                .await
                .map_err(|e| ExecutorError::Backend(format!("artifact meta: {e}")))?;
        }
        Ok(())
    }
}

/// Renew the lease on an interval; flip `abort_tx` once renewal fails.
async fn heartbeat_loop(
    store: Arc<dyn Storage>,
    job_id: JobId,
    owner: LeaseOwner,
    interval: Duration,
    lease_ttl: Duration,
    abort_tx: watch::Sender<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the claim itself counts as the first beat
    loop {
        tick.tick().await;
        match store
            .renew_lease(&job_id, &owner, lease_ttl.as_millis() as i64)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, "Lease renewal refused");
                let _ = abort_tx.send(true);
                break;
            }
            // Transient storage error: keep the worker going and retry.
            Err(e) => warn!(job_id = %job_id, error = %e, "Lease renewal errored"),
        }
    }
}

fn work_dir_for(job_id: &JobId) -> PathBuf {
    std::env::temp_dir().join(format!("task-relay-{}", job_id.as_str()))
}

fn map_failure(e: &ExecutorError) -> ReasonCode {
    match e {
        ExecutorError::Backend(_) => ReasonCode::ExecutorError,
        ExecutorError::BadArtifacts(_) => ReasonCode::BadArtifacts,
        ExecutorError::Policy(_) => ReasonCode::Policy,
        ExecutorError::Timeout { .. } => ReasonCode::Timeout,
        ExecutorError::RepoPrepare(_) => ReasonCode::ExecutorError,
        ExecutorError::Io(_) => ReasonCode::InternalError,
    }
}
