//! Job entity and state machine.

use serde::{Deserialize, Serialize};

use super::ids::{CommitHash, JobId, LeaseOwner};
use super::spec::JobSpec;

/// State of a job. Wire spellings are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting in the priority queue.
    Queued,
    /// Leased to a worker and executing.
    Running,
    /// Paused on an open Ask.
    WaitingOnAnswer,
    /// Lease expired without completion; reclaimable.
    Stale,
    /// Finished successfully.
    Succeeded,
    /// Finished with a failure reason.
    Failed,
    /// Canceled by an operator.
    Canceled,
    /// Exceeded its TTL before finishing.
    Expired,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Canceled) | (Queued, Expired) |
            // From Running
            (Running, Succeeded) | (Running, Failed) | (Running, Canceled) |
            (Running, Expired) | (Running, Stale) | (Running, WaitingOnAnswer) |
            // From WaitingOnAnswer
            (WaitingOnAnswer, Running) | (WaitingOnAnswer, Failed) |
            (WaitingOnAnswer, Canceled) | (WaitingOnAnswer, Expired) |
            // From Stale (reclaim or give up)
            (Stale, Running) | (Stale, Failed) | (Stale, Expired)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Canceled | Self::Expired
        )
    }

    /// States in which a lease may be held.
    pub fn holds_lease(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingOnAnswer)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::WaitingOnAnswer => "WAITING_ON_ANSWER",
            Self::Stale => "STALE",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "WAITING_ON_ANSWER" => Ok(Self::WaitingOnAnswer),
            "STALE" => Ok(Self::Stale),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            "EXPIRED" => Ok(Self::Expired),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Job priority. `P0` is most urgent; ordering matches dispatch order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Priority {
    P0,
    #[default]
    P1,
    P2,
}

impl Priority {
    /// Numeric rank used in `ORDER BY priority ASC`.
    pub fn rank(&self) -> i64 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => Self::P0,
            2 => Self::P2,
            _ => Self::P1,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        };
        write!(f, "{s}")
    }
}

/// Stable, user-visible failure reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    /// Context envelope hash did not match the declared hash.
    EContextMismatch,
    /// Runner attempted a tool outside the ask's whitelist.
    ECapsViolation,
    /// Ask was missing its required envelope.
    ENoContextEnvelope,
    /// Executor output did not parse into the three sections.
    BadArtifacts,
    /// Generated diff failed apply-check against the baseline.
    Conflict,
    /// Runner or executor refused on policy grounds.
    Policy,
    /// Executor backend crashed or exited non-zero.
    ExecutorError,
    /// Exceeded the configured time budget.
    Timeout,
    /// Anything else.
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EContextMismatch => "E_CONTEXT_MISMATCH",
            Self::ECapsViolation => "E_CAPS_VIOLATION",
            Self::ENoContextEnvelope => "E_NO_CONTEXT_ENVELOPE",
            Self::BadArtifacts => "BAD_ARTIFACTS",
            Self::Conflict => "CONFLICT",
            Self::Policy => "POLICY",
            Self::ExecutorError => "EXECUTOR_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "E_CONTEXT_MISMATCH" => Ok(Self::EContextMismatch),
            "E_CAPS_VIOLATION" => Ok(Self::ECapsViolation),
            "E_NO_CONTEXT_ENVELOPE" => Ok(Self::ENoContextEnvelope),
            "BAD_ARTIFACTS" => Ok(Self::BadArtifacts),
            "CONFLICT" => Ok(Self::Conflict),
            "POLICY" => Ok(Self::Policy),
            "EXECUTOR_ERROR" => Ok(Self::ExecutorError),
            "TIMEOUT" => Ok(Self::Timeout),
            "INTERNAL_ERROR" => Ok(Self::InternalError),
            other => Err(format!("unknown reason code: {other}")),
        }
    }
}

/// A persisted job row. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub idempotency_key: String,
    pub state: JobState,
    /// Strictly monotone; bumped on every state write.
    pub state_version: i64,
    pub priority: Priority,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub ttl_s: i64,
    pub heartbeat_at: Option<i64>,
    pub lease_owner: Option<LeaseOwner>,
    pub lease_expires_at: Option<i64>,
    /// Number of lease acquisitions (initial dispatch + stale reclaims).
    pub attempt: u32,
    pub spec: JobSpec,
    pub summary: Option<String>,
    pub reason_code: Option<ReasonCode>,
}

impl Job {
    /// Most recent lifecycle timestamp: finished, else started, else created.
    pub fn last_update(&self) -> i64 {
        self.finished_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    /// Wall-clock duration, available once both endpoints are set.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }

    pub fn baseline_commit(&self) -> CommitHash {
        CommitHash::new(self.spec.repo.baseline_commit.clone())
    }
}

/// Read-model returned by `getStatus` and the MCP status resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    pub last_update: i64,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr: Option<serde_json::Value>,
}

impl JobStatus {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            state: job.state,
            summary: job.summary.clone(),
            reason_code: job.reason_code,
            last_update: job.last_update(),
            attempt: job.attempt,
            duration_ms: job.duration_ms(),
            pr: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(JobState::Queued.can_transition_to(JobState::Running));
        assert!(JobState::Queued.can_transition_to(JobState::Canceled));
        assert!(JobState::Queued.can_transition_to(JobState::Expired));
        assert!(JobState::Running.can_transition_to(JobState::WaitingOnAnswer));
        assert!(JobState::Running.can_transition_to(JobState::Stale));
        assert!(JobState::WaitingOnAnswer.can_transition_to(JobState::Running));
        assert!(JobState::Stale.can_transition_to(JobState::Running));
        assert!(JobState::Stale.can_transition_to(JobState::Failed));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!JobState::Queued.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Queued.can_transition_to(JobState::WaitingOnAnswer));
        assert!(!JobState::WaitingOnAnswer.can_transition_to(JobState::Succeeded));
        assert!(!JobState::Stale.can_transition_to(JobState::Canceled));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Queued));
        assert!(!JobState::Canceled.can_transition_to(JobState::Running));
        assert!(!JobState::Expired.can_transition_to(JobState::Running));
    }

    #[test]
    fn terminal_states_have_no_exit() {
        use JobState::*;
        for terminal in [Succeeded, Failed, Canceled, Expired] {
            assert!(terminal.is_terminal());
            for target in [
                Queued,
                Running,
                WaitingOnAnswer,
                Stale,
                Succeeded,
                Failed,
                Canceled,
                Expired,
            ] {
                assert!(
                    !terminal.can_transition_to(target),
                    "{terminal} must not transition to {target}"
                );
            }
        }
    }

    #[test]
    fn lease_states() {
        assert!(JobState::Running.holds_lease());
        assert!(JobState::WaitingOnAnswer.holds_lease());
        assert!(!JobState::Queued.holds_lease());
        assert!(!JobState::Stale.holds_lease());
    }

    #[test]
    fn state_wire_spelling() {
        let json = serde_json::to_string(&JobState::WaitingOnAnswer).unwrap();
        assert_eq!(json, "\"WAITING_ON_ANSWER\"");
        let parsed: JobState = serde_json::from_str("\"QUEUED\"").unwrap();
        assert_eq!(parsed, JobState::Queued);
    }

    #[test]
    fn state_display_roundtrip() {
        for state in [
            JobState::Queued,
            JobState::Running,
            JobState::WaitingOnAnswer,
            JobState::Stale,
            JobState::Succeeded,
            JobState::Failed,
            JobState::Canceled,
            JobState::Expired,
        ] {
            let parsed: JobState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn priority_ordering_matches_rank() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P2);
        assert_eq!(Priority::from_rank(Priority::P0.rank()), Priority::P0);
    }

    #[test]
    fn reason_code_roundtrip() {
        for code in [
            ReasonCode::EContextMismatch,
            ReasonCode::BadArtifacts,
            ReasonCode::Conflict,
            ReasonCode::Policy,
            ReasonCode::ExecutorError,
            ReasonCode::Timeout,
            ReasonCode::InternalError,
        ] {
            let parsed: ReasonCode = code.as_str().parse().unwrap();
            assert_eq!(parsed, code);
        }
    }
}
