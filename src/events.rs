//! In-process event bus.
//!
//! The Job Manager publishes here; the HTTP bridge and the Answer Runner
//! subscribe. Delivery is broadcast fan-out: a send never blocks the
//! emitter, and a subscriber that falls behind observes a lag error rather
//! than stalling anyone else.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{Answer, Ask, JobId, JobState};

/// Events published by the Job Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A new Ask was stored and its job moved to WAITING_ON_ANSWER.
    AskCreated { ask: Ask },
    /// An Answer was recorded for an Ask.
    AnswerRecorded { answer: Answer },
    /// A job changed state.
    JobStateChanged {
        job_id: JobId,
        state: JobState,
        state_version: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

impl RelayEvent {
    /// The job this event concerns.
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::AskCreated { ask } => &ask.job_id,
            Self::AnswerRecorded { answer } => &answer.job_id,
            Self::JobStateChanged { job_id, .. } => job_id,
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never fails; a send with no subscribers is logged
    /// at debug and dropped.
    pub fn publish(&self, event: RelayEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(error = %e, "Event published with no subscribers");
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
