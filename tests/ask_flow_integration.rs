//! Integration tests for the Ask/Answer HTTP bridge.
//!
//! Each test spins up an Axum server on a random port over an in-memory
//! storage kernel and exercises the real HTTP contract with reqwest:
//! ask creation, long-polling, external answers, history, and SSE.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use task_relay::bridge::{bridge_routes, BridgeState};
use task_relay::config::BridgeConfig;
use task_relay::domain::{
    stable_hash_context, JobId, JobSpec, JobState, LeaseOwner,
};
use task_relay::events::EventBus;
use task_relay::manager::JobManager;
use task_relay::store::{LibSqlBackend, Storage};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    base: String,
    manager: Arc<JobManager>,
    shutdown_tx: watch::Sender<bool>,
    client: reqwest::Client,
}

/// Start a bridge server on a random port.
async fn start_server() -> Harness {
    let store: Arc<dyn Storage> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let bus = EventBus::new(64);
    let manager = Arc::new(JobManager::new(store, bus));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = BridgeState {
        manager: Arc::clone(&manager),
        config: BridgeConfig {
            long_poll_timeout: Duration::from_secs(5),
            sse_heartbeat: Duration::from_secs(30),
            ..BridgeConfig::default()
        },
        shutdown: shutdown_rx,
    };
    let app = bridge_routes(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base: format!("http://127.0.0.1:{port}"),
        manager,
        shutdown_tx,
        client: reqwest::Client::new(),
    }
}

fn job_spec(key: &str) -> JobSpec {
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

/// Submit a job and lease it so it is RUNNING.
async fn running_job(harness: &Harness, key: &str) -> JobId {
    let id = harness.manager.submit(job_spec(key)).await.unwrap();
    harness
        .manager
        .store()
        .acquire_lease(&LeaseOwner::new("itest-worker"), 60_000)
        .await
        .unwrap()
        .unwrap();
    id
}

fn ask_body(job_id: &JobId, step: &str) -> Value {
    let envelope = json!({"role": "default"});
    json!({
        "type": "Ask",
        "job_id": job_id,
        "step_id": step,
        "ask_type": "RESOURCE_FETCH",
        "prompt": "list columns",
        "context_hash": stable_hash_context(&envelope),
        "context_envelope": envelope
    })
}

#[tokio::test]
async fn post_ask_returns_202_with_location() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let response = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 202);
        let location = response
            .headers()
            .get("location")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let ask: Value = response.json().await.unwrap();
        assert_eq!(location, format!("/asks/{}/answer", ask["ask_id"].as_str().unwrap()));
        assert_eq!(ask["status"], "PENDING");

        // The job is now parked on the ask.
        let job = harness.manager.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::WaitingOnAnswer);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn post_ask_rejects_queued_job_with_400() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = harness.manager.submit(job_spec("K1")).await.unwrap();

        let response = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 400);
        let body: Value = response.json().await.unwrap();
        assert!(body["error"].as_str().unwrap().contains("running"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn post_ask_rejects_bad_payload_with_400() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let mut body = ask_body(&job_id, "s1");
        body["context_hash"] = json!("NOT-A-HASH");
        let response = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn long_poll_resolves_when_answer_posted() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let ask: Value = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ask_id = ask["ask_id"].as_str().unwrap().to_string();

        // Long-poll in the background while the answer arrives over HTTP.
        let poll = {
            let client = harness.client.clone();
            let url = format!("{}/asks/{}/answer?wait=5s", harness.base, ask_id);
            tokio::spawn(async move { client.get(url).send().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let answer_response = harness
            .client
            .post(format!("{}/answers", harness.base))
            .json(&json!({
                "type": "Answer",
                "ask_id": ask_id,
                "job_id": job_id,
                "step_id": "s1",
                "status": "ANSWERED",
                "answer_text": "id, name, created_at"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(answer_response.status(), 202);

        let poll_response = poll.await.unwrap();
        assert_eq!(poll_response.status(), 200);
        let answer: Value = poll_response.json().await.unwrap();
        assert_eq!(answer["answer_text"], "id, name, created_at");
        assert_eq!(answer["status"], "ANSWERED");

        // ANSWERED releases the executor: the job runs again.
        let job = harness.manager.get(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn long_poll_times_out_with_204() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let ask: Value = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let response = harness
            .client
            .get(format!(
                "{}/asks/{}/answer?wait=1s",
                harness.base,
                ask["ask_id"].as_str().unwrap()
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 204);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn long_poll_unknown_ask_is_400() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let response = harness
            .client
            .get(format!("{}/asks/not-an-ask/answer?wait=1s", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ask_history_lists_pairs() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let ask: Value = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ask_id = ask["ask_id"].as_str().unwrap();

        harness
            .client
            .post(format!("{}/answers", harness.base))
            .json(&json!({
                "type": "Answer",
                "ask_id": ask_id,
                "job_id": job_id,
                "step_id": "s1",
                "status": "ANSWERED",
                "answer_text": "done"
            }))
            .send()
            .await
            .unwrap();

        let history: Value = harness
            .client
            .get(format!("{}/jobs/{}/asks", harness.base, job_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(history["jobId"], job_id.as_str());
        let asks = history["asks"].as_array().unwrap();
        assert_eq!(asks.len(), 1);
        assert_eq!(asks[0]["ask"]["ask_id"], ask_id);
        assert_eq!(asks[0]["answer"]["answer_text"], "done");

        // Unknown job ids are a 400, not an empty list.
        let missing = harness
            .client
            .get(format!("{}/jobs/job_nope/asks", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 400);
    })
    .await
    .expect("test timed out");
}

/// Read SSE frames until `predicate` matches one, returning all frames seen.
async fn collect_sse_until(
    response: reqwest::Response,
    predicate: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut frames = Vec::new();
    while let Some(chunk) = stream.next().await {
        buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        while let Some(boundary) = buffer.find("\n\n") {
            let frame = buffer[..boundary].to_string();
            buffer = buffer[boundary + 2..].to_string();
            let done = predicate(&frame);
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
    frames
}

#[tokio::test]
async fn sse_stream_delivers_ask_answer_status_in_order() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let response = harness
            .client
            .get(format!("{}/jobs/{}/events", harness.base, job_id))
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let events_task = tokio::spawn(collect_sse_until(response, |frame| {
            frame.contains("event: status") && frame.contains("RUNNING")
        }));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ask: Value = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        harness
            .client
            .post(format!("{}/answers", harness.base))
            .json(&json!({
                "type": "Answer",
                "ask_id": ask["ask_id"],
                "job_id": job_id,
                "step_id": "s1",
                "status": "ANSWERED",
                "answer_text": "yes"
            }))
            .send()
            .await
            .unwrap();

        let frames = events_task.await.unwrap();
        let connected = frames.iter().position(|f| f.contains("event: connected"));
        let ask_created = frames
            .iter()
            .position(|f| f.contains("event: log") && f.contains("ask.created"));
        let answer = frames.iter().position(|f| f.contains("event: answer"));
        let answer_recorded = frames
            .iter()
            .position(|f| f.contains("event: log") && f.contains("answer.recorded"));
        let status_running = frames
            .iter()
            .position(|f| f.contains("event: status") && f.contains("RUNNING"));

        let connected = connected.expect("connected frame");
        let ask_created = ask_created.expect("ask.created frame");
        let answer = answer.expect("answer frame");
        let answer_recorded = answer_recorded.expect("answer.recorded frame");
        let status_running = status_running.expect("status frame");

        assert!(connected < ask_created);
        assert!(ask_created < answer);
        assert!(answer < answer_recorded);
        assert!(answer_recorded < status_running);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_resolves_pending_long_polls_with_503() {
    timeout(TEST_TIMEOUT, async {
        let harness = start_server().await;
        let job_id = running_job(&harness, "K1").await;

        let ask: Value = harness
            .client
            .post(format!("{}/asks", harness.base))
            .json(&ask_body(&job_id, "s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let poll = {
            let client = harness.client.clone();
            let url = format!(
                "{}/asks/{}/answer?wait=5s",
                harness.base,
                ask["ask_id"].as_str().unwrap()
            );
            tokio::spawn(async move { client.get(url).send().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        harness.shutdown_tx.send(true).unwrap();

        let response = poll.await.unwrap();
        assert_eq!(response.status(), 503);
    })
    .await
    .expect("test timed out");
}
