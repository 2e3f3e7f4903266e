//! Long-poll resolution for `GET /asks/{id}/answer`.
//!
//! The handler subscribes to the event bus *before* reading the database,
//! so a recorded answer can never slip between the read and the wait: a
//! dropped bus event only costs latency, never a lost answer.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::domain::{Answer, AskId};
use crate::events::RelayEvent;
use crate::manager::JobManager;
use crate::store::Storage;

/// How a long-poll request resolved.
#[derive(Debug)]
pub enum LongPollOutcome {
    /// The answer, as most recently stored at the moment of resolution.
    Answer(Box<Answer>),
    /// No answer arrived inside the wait window.
    Timeout,
    /// The ask id does not exist.
    UnknownAsk,
    /// The server is shutting down.
    Shutdown,
    /// Storage failed underneath the poll.
    StorageError(String),
}

/// Wait up to `wait` for the answer to `ask_id`.
pub async fn wait_for_answer(
    manager: &JobManager,
    ask_id: &AskId,
    wait: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> LongPollOutcome {
    // Subscribe first; events recorded after this point cannot be missed.
    let mut rx = manager.bus().subscribe();

    match manager.store().get_ask(ask_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return LongPollOutcome::UnknownAsk,
        Err(e) => return LongPollOutcome::StorageError(e.to_string()),
    }
    match manager.store().get_answer(ask_id).await {
        Ok(Some(answer)) => return LongPollOutcome::Answer(Box::new(answer)),
        Ok(None) => {}
        Err(e) => return LongPollOutcome::StorageError(e.to_string()),
    }

    let deadline = tokio::time::Instant::now() + wait;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(RelayEvent::AnswerRecorded { answer }) if &answer.ask_id == ask_id => {
                    // Re-read so the caller observes the most recent write.
                    return match manager.store().get_answer(ask_id).await {
                        Ok(Some(answer)) => LongPollOutcome::Answer(Box::new(answer)),
                        Ok(None) => LongPollOutcome::Answer(Box::new(answer)),
                        Err(e) => LongPollOutcome::StorageError(e.to_string()),
                    };
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Long-poll subscriber lagged; re-checking store");
                    match manager.store().get_answer(ask_id).await {
                        Ok(Some(answer)) => return LongPollOutcome::Answer(Box::new(answer)),
                        Ok(None) => {}
                        Err(e) => return LongPollOutcome::StorageError(e.to_string()),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return LongPollOutcome::Shutdown;
                }
            },
            _ = tokio::time::sleep_until(deadline) => return LongPollOutcome::Timeout,
            _ = shutdown.changed() => return LongPollOutcome::Shutdown,
        }
    }
}

/// Parse a `wait=Ns` query value (`25s` or bare `25`), clamped to `max`.
pub fn parse_wait(raw: Option<&str>, max: Duration) -> Duration {
    let Some(raw) = raw else {
        return max;
    };
    let trimmed = raw.strip_suffix('s').unwrap_or(raw);
    match trimmed.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds).min(max),
        Err(_) => max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::tests_support::valid_spec;
    use crate::domain::{
        stable_hash_context, AnswerPayload, AnswerStatus, AskPayload, AskType, JobId,
        LeaseOwner,
    };
    use crate::manager::tests_support::memory_manager;
    use serde_json::json;
    use std::sync::Arc;

    async fn running_job(manager: &JobManager) -> JobId {
        let id = manager.submit(valid_spec("K1")).await.unwrap();
        manager
            .store()
            .acquire_lease(&LeaseOwner::new("w"), 60_000)
            .await
            .unwrap()
            .unwrap();
        id
    }

    fn ask_payload(job_id: &JobId) -> AskPayload {
        let envelope = json!({"role": "default"});
        AskPayload {
            kind: "Ask".into(),
            ask_id: None,
            job_id: job_id.clone(),
            step_id: "s1".into(),
            ask_type: AskType::Clarification,
            prompt: "which one?".into(),
            context_hash: stable_hash_context(&envelope),
            context_envelope: envelope,
            constraints: None,
            role_id: None,
            meta: None,
        }
    }

    #[test]
    fn wait_parsing_and_clamping() {
        let max = Duration::from_secs(30);
        assert_eq!(parse_wait(None, max), max);
        assert_eq!(parse_wait(Some("5s"), max), Duration::from_secs(5));
        assert_eq!(parse_wait(Some("5"), max), Duration::from_secs(5));
        assert_eq!(parse_wait(Some("500s"), max), max);
        assert_eq!(parse_wait(Some("junk"), max), max);
    }

    #[tokio::test]
    async fn unknown_ask_resolves_immediately() {
        let (manager, _bus) = memory_manager().await;
        let (_tx, shutdown) = watch::channel(false);
        let outcome = wait_for_answer(
            &manager,
            &AskId::new("missing"),
            Duration::from_secs(5),
            shutdown,
        )
        .await;
        assert!(matches!(outcome, LongPollOutcome::UnknownAsk));
    }

    #[tokio::test]
    async fn existing_answer_returns_without_waiting() {
        let (manager, _bus) = memory_manager().await;
        let job_id = running_job(&manager).await;
        let ask = manager.create_ask(ask_payload(&job_id)).await.unwrap();
        manager
            .record_answer(AnswerPayload {
                kind: "Answer".into(),
                ask_id: ask.ask_id.clone(),
                job_id: job_id.clone(),
                step_id: "s1".into(),
                status: AnswerStatus::Answered,
                answer_text: Some("done".into()),
                answer_json: None,
                attestation: None,
                artifacts: None,
                policy_trace: None,
                cacheable: None,
                ask_back: None,
                error: None,
            })
            .await
            .unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let outcome = wait_for_answer(&manager, &ask.ask_id, Duration::ZERO, shutdown).await;
        match outcome {
            LongPollOutcome::Answer(answer) => {
                assert_eq!(answer.answer_text.as_deref(), Some("done"))
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_resolves_when_answer_arrives() {
        let (manager, _bus) = memory_manager().await;
        let manager = Arc::clone(&manager);
        let job_id = running_job(&manager).await;
        let ask = manager.create_ask(ask_payload(&job_id)).await.unwrap();

        let answering = {
            let manager = Arc::clone(&manager);
            let ask_id = ask.ask_id.clone();
            let job_id = job_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                manager
                    .record_answer(AnswerPayload {
                        kind: "Answer".into(),
                        ask_id,
                        job_id,
                        step_id: "s1".into(),
                        status: AnswerStatus::Answered,
                        answer_text: Some("late".into()),
                        answer_json: None,
                        attestation: None,
                        artifacts: None,
                        policy_trace: None,
                        cacheable: None,
                        ask_back: None,
                        error: None,
                    })
                    .await
                    .unwrap();
            })
        };

        let (_tx, shutdown) = watch::channel(false);
        let outcome =
            wait_for_answer(&manager, &ask.ask_id, Duration::from_secs(5), shutdown).await;
        answering.await.unwrap();
        match outcome {
            LongPollOutcome::Answer(answer) => {
                assert_eq!(answer.answer_text.as_deref(), Some("late"))
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn poll_times_out_to_204() {
        let (manager, _bus) = memory_manager().await;
        let job_id = running_job(&manager).await;
        let ask = manager.create_ask(ask_payload(&job_id)).await.unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let outcome =
            wait_for_answer(&manager, &ask.ask_id, Duration::from_millis(50), shutdown).await;
        assert!(matches!(outcome, LongPollOutcome::Timeout));
    }

    #[tokio::test]
    async fn shutdown_resolves_pending_polls() {
        let (manager, _bus) = memory_manager().await;
        let job_id = running_job(&manager).await;
        let ask = manager.create_ask(ask_payload(&job_id)).await.unwrap();

        let (tx, shutdown) = watch::channel(false);
        let poll = {
            let manager = Arc::clone(&manager);
            let ask_id = ask.ask_id.clone();
            tokio::spawn(async move {
                wait_for_answer(&manager, &ask_id, Duration::from_secs(30), shutdown).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), poll)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, LongPollOutcome::Shutdown));
    }
}
