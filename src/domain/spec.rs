//! Job specification — the immutable description of executor work.

use serde::{Deserialize, Serialize};

use super::job::Priority;

/// Kind of repository a job operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Git,
    Local,
}

/// Repository pin for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    #[serde(rename = "type")]
    pub repo_type: RepoType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub base_branch: String,
    pub baseline_commit: String,
}

/// What the executor is asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance: Vec<String>,
}

/// File-level boundaries for the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeSpec {
    #[serde(default)]
    pub read_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_globs: Option<Vec<String>>,
    #[serde(default)]
    pub disallow_reformatting: bool,
}

/// Optional pre-computed context shipped with the spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir_tree_digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_signatures: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_snippets: Option<Vec<String>>,
}

/// The three artifacts every job must produce, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputKind {
    Diff,
    TestPlan,
    Notes,
}

/// Execution knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    pub preferred_model: String,
    #[serde(default = "default_sandbox")]
    pub sandbox: String,
    #[serde(default = "default_ask_policy")]
    pub ask_policy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_ttl_s")]
    pub ttl_s: u64,
}

fn default_sandbox() -> String {
    "read-only".to_string()
}

fn default_ask_policy() -> String {
    "untrusted".to_string()
}

fn default_ttl_s() -> u64 {
    3600
}

/// Immutable job specification, validated at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub repo: RepoSpec,
    pub task: TaskSpec,
    pub scope: ScopeSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextSpec>,
    #[serde(default = "JobSpec::default_output_contract")]
    pub output_contract: Vec<OutputKind>,
    pub execution: ExecutionSpec,
    pub idempotency_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify: Option<serde_json::Value>,
}

impl JobSpec {
    pub fn default_output_contract() -> Vec<OutputKind> {
        vec![OutputKind::Diff, OutputKind::TestPlan, OutputKind::Notes]
    }

    /// Per-job executor timeout, defaulting to 300 seconds.
    pub fn timeout_ms(&self) -> u64 {
        self.execution.timeout_s.unwrap_or(300) * 1000
    }

    /// Validate the spec before persisting. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        match self.repo.repo_type {
            RepoType::Git => {
                if self.repo.url.as_deref().unwrap_or("").is_empty() {
                    errors.push(FieldError::new("repo.url", "required for repo.type=git"));
                }
            }
            RepoType::Local => {
                if self.repo.path.as_deref().unwrap_or("").is_empty() {
                    errors.push(FieldError::new("repo.path", "required for repo.type=local"));
                }
            }
        }
        if self.repo.base_branch.is_empty() {
            errors.push(FieldError::new("repo.baseBranch", "must not be empty"));
        }
        if self.repo.baseline_commit.is_empty() {
            errors.push(FieldError::new("repo.baselineCommit", "must not be empty"));
        }

        if self.task.title.trim().is_empty() {
            errors.push(FieldError::new("task.title", "must not be empty"));
        }
        if self.task.description.trim().is_empty() {
            errors.push(FieldError::new("task.description", "must not be empty"));
        }

        if self.output_contract != Self::default_output_contract() {
            errors.push(FieldError::new(
                "outputContract",
                "must be [DIFF, TEST_PLAN, NOTES]",
            ));
        }

        if self.execution.preferred_model.trim().is_empty() {
            errors.push(FieldError::new(
                "execution.preferredModel",
                "must not be empty",
            ));
        }
        if self.execution.ttl_s == 0 {
            errors.push(FieldError::new("execution.ttlS", "must be positive"));
        }
        if let Some(timeout) = self.execution.timeout_s {
            if timeout == 0 {
                errors.push(FieldError::new("execution.timeoutS", "must be positive"));
            }
        }

        if self.idempotency_key.trim().is_empty() {
            errors.push(FieldError::new("idempotencyKey", "must not be empty"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Join field errors into a single human-readable message.
pub fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
