//! SSE fan-out for `GET /jobs/{id}/events`.
//!
//! Each client gets a forwarder task bridging a bus subscription into the
//! response stream. Frames are named events (`connected`, `answer`, `log`,
//! `status`, `heartbeat`); heartbeats are real named events so
//! intermediaries keep the connection open. Events for a job are forwarded
//! in emit order — one broadcast channel, one forwarder per client.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::domain::JobId;
use crate::events::{EventBus, RelayEvent};

/// Buffered frames per client before backpressure kicks in.
const CLIENT_BUFFER: usize = 64;

/// Build the per-client SSE frame stream for a job.
pub fn job_event_stream(
    bus: &EventBus,
    job_id: JobId,
    heartbeat: Duration,
    shutdown: watch::Receiver<bool>,
) -> impl futures::Stream<Item = Result<Event, Infallible>> {
    let rx = bus.subscribe();
    let (tx, frames) = mpsc::channel::<Event>(CLIENT_BUFFER);

    tokio::spawn(forward_events(rx, tx, job_id, heartbeat, shutdown));

    frames.map(Ok)
}

async fn forward_events(
    mut rx: broadcast::Receiver<RelayEvent>,
    mut tx: mpsc::Sender<Event>,
    job_id: JobId,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let connected = Event::default()
        .event("connected")
        .data(json!({"jobId": job_id}).to_string());
    if tx.send(connected).await.is_err() {
        return;
    }

    let mut beat = tokio::time::interval(heartbeat);
    beat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    beat.tick().await; // fires immediately; the connected frame covers it

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if event.job_id() != &job_id {
                        continue;
                    }
                    for frame in frames_for(&event) {
                        if tx.send(frame).await.is_err() {
                            debug!(job_id = %job_id, "SSE client disconnected");
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(job_id = %job_id, missed, "SSE client lagged behind broadcast");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(job_id = %job_id, "Event bus closed; ending SSE stream");
                    return;
                }
            },
            _ = beat.tick() => {
                let frame = Event::default().event("heartbeat").data("{}");
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            _ = shutdown.changed() => {
                debug!(job_id = %job_id, "Shutdown; closing SSE stream");
                return;
            }
        }
    }
}

/// The frames a bus event expands into, in order.
fn frames_for(event: &RelayEvent) -> Vec<Event> {
    match event {
        RelayEvent::AskCreated { ask } => vec![Event::default().event("log").data(
            json!({
                "type": "ask.created",
                "askId": ask.ask_id,
                "stepId": ask.step_id,
                "askType": ask.ask_type.as_str(),
            })
            .to_string(),
        )],
        RelayEvent::AnswerRecorded { answer } => vec![
            Event::default()
                .event("answer")
                .data(serde_json::to_string(answer).unwrap_or_else(|_| "{}".into())),
            Event::default().event("log").data(
                json!({
                    "type": "answer.recorded",
                    "askId": answer.ask_id,
                    "status": answer.status.as_str(),
                })
                .to_string(),
            ),
        ],
        RelayEvent::JobStateChanged {
            job_id,
            state,
            state_version,
            summary,
        } => vec![Event::default().event("status").data(
            json!({
                "jobId": job_id,
                "state": state,
                "stateVersion": state_version,
                "summary": summary,
            })
            .to_string(),
        )],
    }
}
