//! End-to-end scheduler scenarios exercised through the library surface:
//! idempotent submission, single-winner lease dispatch, and the full
//! ask → runner → answer loop with a stub LLM.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;

use task_relay::config::RunnerConfig;
use task_relay::domain::{
    stable_hash_context, AskPayload, AskType, JobId, JobState, LeaseOwner, ReasonCode,
};
use task_relay::error::LlmError;
use task_relay::events::EventBus;
use task_relay::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use task_relay::manager::JobManager;
use task_relay::runner::{AnswerRunner, RoleLibrary};
use task_relay::store::{LibSqlBackend, Storage};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Stub LLM provider counting invocations (no real API calls).
struct StubLlm {
    response: String,
    calls: AtomicU32,
}

impl StubLlm {
    fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CompletionResponse {
            text: self.response.clone(),
            input_tokens: 1,
            output_tokens: 1,
        })
    }
}

async fn manager_fixture() -> Arc<JobManager> {
    let store: Arc<dyn Storage> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    Arc::new(JobManager::new(store, EventBus::new(128)))
}

fn job_spec(key: &str) -> task_relay::domain::JobSpec {
    serde_json::from_value(json!({
        "repo": {
            "type": "git",
            "url": "https://example.com/repo.git",
            "baseBranch": "main",
            "baselineCommit": "abc123"
        },
        "task": {"title": "t", "description": "d"},
        "scope": {"readPaths": []},
        "execution": {"preferredModel": "m"},
        "idempotencyKey": key
    }))
    .unwrap()
}

fn ask_payload(job_id: &JobId, step: &str, envelope: Value) -> AskPayload {
    AskPayload {
        kind: "Ask".into(),
        ask_id: None,
        job_id: job_id.clone(),
        step_id: step.into(),
        ask_type: AskType::ResourceFetch,
        prompt: "list columns".into(),
        context_hash: stable_hash_context(&envelope),
        context_envelope: envelope,
        constraints: None,
        role_id: None,
        meta: None,
    }
}

/// Scenario: submit K1, resubmit K1 (same job), cancel, resubmit (new job).
#[tokio::test]
async fn idempotency_across_cancellation() {
    timeout(TEST_TIMEOUT, async {
        let manager = manager_fixture().await;

        let job_a = manager.submit(job_spec("K1")).await.unwrap();
        let again = manager.submit(job_spec("K1")).await.unwrap();
        assert_eq!(job_a, again);

        let outcome = manager.cancel(&job_a).await.unwrap();
        assert!(outcome.ok);

        let job_b = manager.submit(job_spec("K1")).await.unwrap();
        assert_ne!(job_a, job_b);
    })
    .await
    .expect("test timed out");
}

/// Scenario: with K concurrent acquirers and M queued jobs, at most
/// min(K, M) succeed and every winner is distinct.
#[tokio::test]
async fn concurrent_lease_acquisition_has_single_winners() {
    timeout(TEST_TIMEOUT, async {
        let manager = manager_fixture().await;

        const JOBS: usize = 4;
        const WORKERS: usize = 10;
        for i in 0..JOBS {
            manager.submit(job_spec(&format!("K{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..WORKERS {
            let store = manager.store().clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire_lease(&LeaseOwner::generate(i), 60_000)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(id) = handle.await.unwrap() {
                winners.push(id);
            }
        }

        assert_eq!(winners.len(), JOBS.min(WORKERS));
        let mut distinct: Vec<&str> = winners.iter().map(|id| id.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), winners.len(), "every winner must be distinct");

        // First dispatch bumps state_version 0 -> 1.
        for id in &winners {
            let job = manager.get(id).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Running);
            assert_eq!(job.state_version, 1);
        }
    })
    .await
    .expect("test timed out");
}

async fn wait_for_job_state(manager: &JobManager, id: &JobId, state: JobState) {
    for _ in 0..100 {
        let job = manager.get(id).await.unwrap().unwrap();
        if job.state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job never reached {state}");
}

/// Scenario: the bus-driven runner answers an ask, attests against the
/// ask's context hash, and the job resumes running.
#[tokio::test]
async fn runner_answers_ask_from_bus_event() {
    timeout(TEST_TIMEOUT, async {
        let manager = manager_fixture().await;
        let llm = Arc::new(StubLlm::new(r#"{"answer_json": {"columns": ["id"]}}"#));
        let roles = Arc::new(RoleLibrary::load(None).unwrap());
        let runner = Arc::new(AnswerRunner::new(
            Arc::clone(&manager),
            Arc::clone(&llm) as Arc<dyn LlmProvider>,
            roles,
            RunnerConfig {
                enabled: true,
                max_retries: 0,
                ..RunnerConfig::default()
            },
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _runner_task = Arc::clone(&runner).spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let job_id = manager.submit(job_spec("K1")).await.unwrap();
        manager
            .store()
            .acquire_lease(&LeaseOwner::new("w"), 60_000)
            .await
            .unwrap()
            .unwrap();

        let ask = manager
            .create_ask(ask_payload(&job_id, "s1", json!({"role": "default"})))
            .await
            .unwrap();

        wait_for_job_state(&manager, &job_id, JobState::Running).await;

        let answer = manager
            .store()
            .get_answer(&ask.ask_id)
            .await
            .unwrap()
            .unwrap();
        let attestation = answer.attestation.expect("attested answer");
        assert_eq!(attestation.context_hash, ask.context_hash);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    })
    .await
    .expect("test timed out");
}

/// Scenario: a tampered envelope (hash kept, facts mutated) yields an
/// E_CONTEXT_MISMATCH error answer without any LLM call, and the job fails
/// with EXECUTOR_ERROR.
#[tokio::test]
async fn tampered_envelope_fails_job_without_llm_call() {
    timeout(TEST_TIMEOUT, async {
        let manager = manager_fixture().await;
        let llm = Arc::new(StubLlm::new("{}"));
        let roles = Arc::new(RoleLibrary::load(None).unwrap());
        let runner = AnswerRunner::new(
            Arc::clone(&manager),
            Arc::clone(&llm) as Arc<dyn LlmProvider>,
            roles,
            RunnerConfig {
                enabled: true,
                max_retries: 0,
                ..RunnerConfig::default()
            },
        );

        let job_id = manager.submit(job_spec("K1")).await.unwrap();
        manager
            .store()
            .acquire_lease(&LeaseOwner::new("w"), 60_000)
            .await
            .unwrap()
            .unwrap();

        let mut ask = manager
            .create_ask(ask_payload(
                &job_id,
                "s1",
                json!({"role": "default", "facts": {"region": "eu"}}),
            ))
            .await
            .unwrap();
        ask.context_envelope = json!({"role": "default", "facts": {"region": "us"}});

        runner.handle_ask(ask.clone()).await;

        let answer = manager
            .store()
            .get_answer(&ask.ask_id)
            .await
            .unwrap()
            .unwrap();
        assert!(answer.error.unwrap().contains("E_CONTEXT_MISMATCH"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);

        let job = manager.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.reason_code, Some(ReasonCode::ExecutorError));
    })
    .await
    .expect("test timed out");
}

/// Scenario: identical decision keys hit the cache; the LLM call counter
/// does not move on the second ask.
#[tokio::test]
async fn decision_cache_suppresses_second_llm_call() {
    timeout(TEST_TIMEOUT, async {
        let manager = manager_fixture().await;
        let llm = Arc::new(StubLlm::new(r#"{"answer_json": {"v": 1}}"#));
        let roles = Arc::new(RoleLibrary::load(None).unwrap());
        let runner = AnswerRunner::new(
            Arc::clone(&manager),
            Arc::clone(&llm) as Arc<dyn LlmProvider>,
            roles,
            RunnerConfig {
                enabled: true,
                max_retries: 0,
                ..RunnerConfig::default()
            },
        );

        let job_id = manager.submit(job_spec("K1")).await.unwrap();
        manager
            .store()
            .acquire_lease(&LeaseOwner::new("w"), 60_000)
            .await
            .unwrap()
            .unwrap();

        let envelope = json!({"role": "default"});
        let first = manager
            .create_ask(ask_payload(&job_id, "s1", envelope.clone()))
            .await
            .unwrap();
        runner.handle_ask(first.clone()).await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);

        let second = manager
            .create_ask(ask_payload(&job_id, "s2", envelope))
            .await
            .unwrap();
        runner.handle_ask(second.clone()).await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1, "second ask must be served from cache");

        let a = manager.store().get_answer(&first.ask_id).await.unwrap().unwrap();
        let b = manager.store().get_answer(&second.ask_id).await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_vec(&a.answer_json).unwrap(),
            serde_json::to_vec(&b.answer_json).unwrap()
        );
    })
    .await
    .expect("test timed out");
}
