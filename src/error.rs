//! Error types for Task Relay.

use std::time::Duration;

/// Top-level error type for the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Ask error: {0}")]
    Ask(#[from] AskError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration file {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job {id} is in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Job {id} write lost a concurrent update race")]
    VersionRace { id: String },

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),
}

/// Ask/Answer protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error("Ask {id} not found")]
    NotFound { id: String },

    #[error("Invalid ask payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid answer payload: {0}")]
    InvalidAnswer(String),

    #[error("Job {job_id} is in state {state}; asks require a running job")]
    JobNotRunning { job_id: String, state: String },

    #[error("Ask already open for job {job_id} step {step_id}")]
    AlreadyOpen { job_id: String, step_id: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("LLM call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Answer Runner errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("E_CONTEXT_MISMATCH: envelope hash {computed} does not match declared {declared}")]
    ContextMismatch { computed: String, declared: String },

    #[error("E_NO_CONTEXT_ENVELOPE: ask {ask_id} carries no context envelope")]
    NoContextEnvelope { ask_id: String },

    #[error("E_CAPS_VIOLATION: tool {tool} is outside the ask's whitelist")]
    CapsViolation { tool: String },

    #[error("Role {role_id} not found")]
    RoleNotFound { role_id: String },

    #[error("Role definition {path} failed to parse: {message}")]
    RoleParse { path: String, message: String },

    #[error("Answer validation failed after {attempts} attempts: {reason}")]
    ValidationExhausted { attempts: u32, reason: String },
}

/// Executor backend errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Executor backend failed: {0}")]
    Backend(String),

    #[error("Executor output did not parse: {0}")]
    BadArtifacts(String),

    #[error("Executor refused on policy grounds: {0}")]
    Policy(String),

    #[error("Executor timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Repository preparation failed: {0}")]
    RepoPrepare(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the scheduler.
pub type Result<T> = std::result::Result<T, Error>;
