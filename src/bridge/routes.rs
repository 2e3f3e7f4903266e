//! REST endpoints for the Ask/Answer bridge.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::domain::{AnswerPayload, AskId, AskPayload, JobId};
use crate::error::{DatabaseError, Error, JobError};
use crate::store::Storage;

use super::longpoll::{parse_wait, wait_for_answer, LongPollOutcome};
use super::sse::job_event_stream;
use super::BridgeState;

/// Build the Axum router for the bridge.
pub fn bridge_routes(state: BridgeState) -> Router {
    Router::new()
        .route("/asks", post(create_ask))
        .route("/asks/{id}/answer", get(poll_answer))
        .route("/answers", post(post_answer))
        .route("/jobs/{id}/asks", get(job_asks))
        .route("/jobs/{id}/events", get(job_events))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "task-relay"}))
}

/// Translate scheduler errors to HTTP responses.
fn error_response(e: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        Error::Ask(_) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Job(JobError::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
        Error::Job(JobError::InvalidTransition { .. }) => StatusCode::BAD_REQUEST,
        Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

/// `POST /asks` — create an Ask, parking the job on it.
async fn create_ask(
    State(state): State<BridgeState>,
    Json(payload): Json<AskPayload>,
) -> impl IntoResponse {
    match state.manager.create_ask(payload).await {
        Ok(ask) => {
            let location = format!("/asks/{}/answer", ask.ask_id);
            (
                StatusCode::ACCEPTED,
                [(header::LOCATION, location)],
                Json(serde_json::to_value(&ask).unwrap_or_default()),
            )
                .into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// `GET /asks/{id}/answer?wait=Ns` — long-poll for the answer.
async fn poll_answer(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let wait = parse_wait(
        params.get("wait").map(String::as_str),
        state.config.long_poll_timeout,
    );
    let ask_id = AskId::new(id);

    match wait_for_answer(&state.manager, &ask_id, wait, state.shutdown.clone()).await {
        LongPollOutcome::Answer(answer) => {
            (StatusCode::OK, Json(serde_json::to_value(&*answer).unwrap_or_default()))
                .into_response()
        }
        LongPollOutcome::Timeout => StatusCode::NO_CONTENT.into_response(),
        LongPollOutcome::UnknownAsk => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown ask id {}", ask_id)})),
        )
            .into_response(),
        LongPollOutcome::Shutdown => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "server is shutting down"})),
        )
            .into_response(),
        LongPollOutcome::StorageError(message) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": message})),
        )
            .into_response(),
    }
}

/// `POST /answers` — record an externally produced answer.
async fn post_answer(
    State(state): State<BridgeState>,
    Json(payload): Json<AnswerPayload>,
) -> impl IntoResponse {
    match state.manager.record_answer(payload).await {
        Ok(answer) => (
            StatusCode::ACCEPTED,
            Json(serde_json::to_value(&answer).unwrap_or_default()),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// `GET /jobs/{id}/asks` — the job's ask/answer history.
async fn job_asks(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let job_id = JobId::new(id);
    match state.manager.get(&job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unknown job id {}", job_id)})),
            )
                .into_response();
        }
        Err(e) => return error_response(&e).into_response(),
    }

    match state.manager.store().list_asks_for_job(&job_id).await {
        Ok(asks) => Json(json!({"jobId": job_id, "asks": asks})).into_response(),
        Err(e) => error_response(&Error::Database(e)).into_response(),
    }
}

/// `GET /jobs/{id}/events` — live SSE stream for a job.
async fn job_events(
    State(state): State<BridgeState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let job_id = JobId::new(id);
    info!(job_id = %job_id, "SSE client connected");
    let stream = job_event_stream(
        state.manager.bus(),
        job_id,
        state.config.sse_heartbeat,
        state.shutdown.clone(),
    );
    Sse::new(stream)
}
