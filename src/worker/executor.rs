//! Executor backend interface.
//!
//! The scheduler core does not implement executors itself; it invokes a
//! backend with the job spec and an isolated work directory and expects the
//! three-section output back. `CommandExecutor` shells out to a configured
//! command; tests use in-process stubs.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::domain::JobSpec;
use crate::error::ExecutorError;

/// Maximum captured output size before truncation (256KB).
const MAX_OUTPUT_SIZE: usize = 256 * 1024;

/// What an executor run produces.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOutput {
    pub diff: String,
    pub test_plan: String,
    pub notes: String,
    pub raw_output: String,
}

/// A backend that can execute one job inside a prepared checkout.
#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    async fn execute(
        &self,
        spec: &JobSpec,
        work_dir: &Path,
    ) -> Result<ExecutorOutput, ExecutorError>;
}

/// Shape the executor command must print on stdout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandResult {
    #[serde(default)]
    diff: String,
    #[serde(default)]
    test_plan: String,
    #[serde(default)]
    notes: String,
}

/// Backend that runs a configured shell command.
///
/// The command receives the job spec as JSON in `TASK_RELAY_JOB_SPEC` plus
/// one `TASK_RELAY_FACT_<NAME>` variable per configured fact, runs with the
/// checkout as its working directory, and prints a JSON object
/// `{diff, testPlan, notes}` on stdout.
pub struct CommandExecutor {
    command: String,
    facts: std::collections::BTreeMap<String, String>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            facts: Default::default(),
        }
    }

    /// Facts forwarded to the executor's environment.
    pub fn with_facts(mut self, facts: std::collections::BTreeMap<String, String>) -> Self {
        self.facts = facts;
        self
    }
}

#[async_trait]
impl ExecutorBackend for CommandExecutor {
    async fn execute(
        &self,
        spec: &JobSpec,
        work_dir: &Path,
    ) -> Result<ExecutorOutput, ExecutorError> {
        let spec_json = serde_json::to_string(spec)
            .map_err(|e| ExecutorError::Backend(format!("spec serialization: {e}")))?;

        debug!(command = %self.command, work_dir = %work_dir.display(), "Invoking executor");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(work_dir)
            .env("TASK_RELAY_JOB_SPEC", spec_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (name, value) in &self.facts {
            command.env(format!("TASK_RELAY_FACT_{}", name.to_ascii_uppercase()), value);
        }
        let output = command.output().await?;

        let mut raw = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            raw.push_str("\n--- stderr ---\n");
            raw.push_str(&stderr);
        }
        if raw.len() > MAX_OUTPUT_SIZE {
            raw.truncate(MAX_OUTPUT_SIZE);
            raw.push_str("\n[truncated]");
        }

        if !output.status.success() {
            return Err(ExecutorError::Backend(format!(
                "exit status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: CommandResult = serde_json::from_str(stdout.trim())
            .map_err(|e| ExecutorError::BadArtifacts(format!("stdout is not valid JSON: {e}")))?;

        Ok(ExecutorOutput {
            diff: parsed.diff,
            test_plan: parsed.test_plan,
            notes: parsed.notes,
            raw_output: raw,
        })
    }
}

/// Placeholder backend used when no executor command is configured.
pub struct UnconfiguredExecutor;

#[async_trait]
impl ExecutorBackend for UnconfiguredExecutor {
    async fn execute(
        &self,
        _spec: &JobSpec,
        _work_dir: &Path,
    ) -> Result<ExecutorOutput, ExecutorError> {
        Err(ExecutorError::Backend(
            "no executor backend configured (set TASK_RELAY_EXECUTOR_CMD)".into(),
        ))
    }
}
