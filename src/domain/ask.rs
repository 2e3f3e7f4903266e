//! Ask/Answer protocol entities and wire payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{AskId, JobId};
use super::spec::{join_field_errors, FieldError};
use crate::error::AskError;

/// The structured question kinds an executor may raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AskType {
    Clarification,
    ResourceFetch,
    PolicyDecision,
    Approval,
    Choice,
}

impl AskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarification => "CLARIFICATION",
            Self::ResourceFetch => "RESOURCE_FETCH",
            Self::PolicyDecision => "POLICY_DECISION",
            Self::Approval => "APPROVAL",
            Self::Choice => "CHOICE",
        }
    }
}

impl std::fmt::Display for AskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLARIFICATION" => Ok(Self::Clarification),
            "RESOURCE_FETCH" => Ok(Self::ResourceFetch),
            "POLICY_DECISION" => Ok(Self::PolicyDecision),
            "APPROVAL" => Ok(Self::Approval),
            "CHOICE" => Ok(Self::Choice),
            other => Err(format!("unknown ask type: {other}")),
        }
    }
}

/// Lifecycle status of an Ask row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AskStatus {
    Pending,
    Answered,
    Rejected,
    Timeout,
    Error,
}

impl AskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Answered => "ANSWERED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for AskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ANSWERED" => Ok(Self::Answered),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown ask status: {other}")),
        }
    }
}

/// Terminal status of an Answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnswerStatus {
    Answered,
    Rejected,
    Timeout,
    Error,
}

impl AnswerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Answered => "ANSWERED",
            Self::Rejected => "REJECTED",
            Self::Timeout => "TIMEOUT",
            Self::Error => "ERROR",
        }
    }

    /// The Ask status an answer of this status settles the Ask into.
    pub fn ask_status(&self) -> AskStatus {
        match self {
            Self::Answered => AskStatus::Answered,
            Self::Rejected => AskStatus::Rejected,
            Self::Timeout => AskStatus::Timeout,
            Self::Error => AskStatus::Error,
        }
    }
}

impl std::str::FromStr for AnswerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ANSWERED" => Ok(Self::Answered),
            "REJECTED" => Ok(Self::Rejected),
            "TIMEOUT" => Ok(Self::Timeout),
            "ERROR" => Ok(Self::Error),
            other => Err(format!("unknown answer status: {other}")),
        }
    }
}

/// Per-ask limits declared by the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskConstraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

/// A persisted Ask. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ask {
    pub ask_id: AskId,
    pub job_id: JobId,
    pub step_id: String,
    pub ask_type: AskType,
    pub prompt: String,
    pub context_envelope: Value,
    /// Lowercase-hex SHA-256 of the canonicalized envelope.
    pub context_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<AskConstraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: i64,
    pub status: AskStatus,
}

/// Proof that an answer was produced against a specific context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub context_hash: String,
    pub role_id: String,
    pub role_version: String,
    pub model: String,
    /// Lowercase-hex SHA-256 of the full assembled prompt.
    pub prompt_fingerprint: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
}

/// A persisted Answer, one-to-one with its Ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub ask_id: AskId,
    pub job_id: JobId,
    pub step_id: String,
    pub status: AnswerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_trace: Option<Value>,
    #[serde(default = "default_cacheable")]
    pub cacheable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_back: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: i64,
}

fn default_cacheable() -> bool {
    true
}

// ── Wire payloads ───────────────────────────────────────────────────────

/// `POST /asks` body. The `type` discriminator is fixed to `"Ask"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_id: Option<AskId>,
    pub job_id: JobId,
    pub step_id: String,
    pub ask_type: AskType,
    pub prompt: String,
    pub context_hash: String,
    pub context_envelope: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<AskConstraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl AskPayload {
    pub fn validate(&self) -> Result<(), AskError> {
        let mut errors: Vec<FieldError> = Vec::new();

        if self.kind != "Ask" {
            errors.push(FieldError::new("type", "must be \"Ask\""));
        }
        if self.job_id.as_str().trim().is_empty() {
            errors.push(FieldError::new("job_id", "must not be empty"));
        }
        if self.step_id.trim().is_empty() {
            errors.push(FieldError::new("step_id", "must not be empty"));
        }
        if self.prompt.trim().is_empty() {
            errors.push(FieldError::new("prompt", "must not be empty"));
        }
        if self.context_hash.len() != 64
            || !self
                .context_hash
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            errors.push(FieldError::new(
                "context_hash",
                "must be 64 lowercase hex chars",
            ));
        }
        match &self.context_envelope {
            Value::Object(map) => {
                if !map.contains_key("role") {
                    errors.push(FieldError::new(
                        "context_envelope.role",
                        "E_NO_CONTEXT_ENVELOPE: role is required",
                    ));
                }
            }
            _ => errors.push(FieldError::new(
                "context_envelope",
                "E_NO_CONTEXT_ENVELOPE: must be an object",
            )),
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AskError::InvalidPayload(join_field_errors(&errors)))
        }
    }
}

/// `POST /answers` body. The `type` discriminator is fixed to `"Answer"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub ask_id: AskId,
    pub job_id: JobId,
    pub step_id: String,
    pub status: AnswerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_json: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Attestation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_trace: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacheable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask_back: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnswerPayload {
    pub fn validate(&self) -> Result<(), AskError> {
        let mut errors: Vec<FieldError> = Vec::new();

        if self.kind != "Answer" {
            errors.push(FieldError::new("type", "must be \"Answer\""));
        }
        if self.ask_id.as_str().trim().is_empty() {
            errors.push(FieldError::new("ask_id", "must not be empty"));
        }
        if self.job_id.as_str().trim().is_empty() {
            errors.push(FieldError::new("job_id", "must not be empty"));
        }
        if self.status == AnswerStatus::Error && self.error.as_deref().unwrap_or("").is_empty() {
            errors.push(FieldError::new("error", "required when status is ERROR"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AskError::InvalidAnswer(join_field_errors(&errors)))
        }
    }

    /// Build the persisted Answer row from this payload.
    pub fn into_answer(self, now_ms: i64) -> Answer {
        Answer {
            ask_id: self.ask_id,
            job_id: self.job_id,
            step_id: self.step_id,
            status: self.status,
            answer_text: self.answer_text,
            answer_json: self.answer_json,
            attestation: self.attestation,
            artifacts: self.artifacts,
            policy_trace: self.policy_trace,
            cacheable: self.cacheable.unwrap_or(true),
            ask_back: self.ask_back,
            error: self.error,
            created_at: now_ms,
        }
    }
}
