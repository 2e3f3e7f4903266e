//! Typed domain model: ids, entities, enumerations, state table, hashing.

pub mod ask;
pub mod envelope;
pub mod event;
pub mod ids;
pub mod job;
pub mod spec;

pub use ask::{
    AnswerPayload, AnswerStatus, Ask, AskConstraints, AskPayload, AskStatus, AskType, Answer,
    Attestation,
};
pub use envelope::{canonical_json, decision_key, sha256_hex, stable_hash_context, ContextEnvelope};
pub use event::{ArtifactKind, ArtifactMeta, DecisionCacheEntry, Event};
pub use ids::{AskId, CommitHash, JobId, LeaseOwner};
pub use job::{Job, JobState, JobStatus, Priority, ReasonCode};
pub use spec::{JobSpec, RepoType};

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
