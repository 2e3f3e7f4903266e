//! Repository preparation and diff validation.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::spec::{RepoSpec, RepoType};
use crate::error::ExecutorError;

/// Prepare the repository inside the work directory and return the checkout
/// path. `repo.type=local` is rejected until its contract is defined.
pub async fn prepare_repository(
    repo: &RepoSpec,
    work_dir: &Path,
) -> Result<PathBuf, ExecutorError> {
    match repo.repo_type {
        RepoType::Git => {
            let url = repo
                .url
                .as_deref()
                .ok_or_else(|| ExecutorError::RepoPrepare("repo.url is missing".into()))?;
            let checkout = work_dir.join("repo");

            run_git(
                work_dir,
                &["clone", "--quiet", url, &checkout.display().to_string()],
            )
            .await?;
            run_git(
                &checkout,
                &["checkout", "--quiet", &repo.baseline_commit],
            )
            .await?;

            debug!(url, commit = %repo.baseline_commit, "Repository prepared");
            Ok(checkout)
        }
        RepoType::Local => Err(ExecutorError::RepoPrepare(
            "local repositories are not supported yet".into(),
        )),
    }
}

/// Check whether a diff applies cleanly to the prepared baseline.
///
/// An empty diff trivially applies. Returns `Ok(false)` when `git apply
/// --check` rejects the patch.
pub async fn apply_check(checkout: &Path, diff: &str) -> Result<bool, ExecutorError> {
    if diff.trim().is_empty() {
        return Ok(true);
    }

    let mut child = Command::new("git")
        .arg("-C")
        .arg(checkout)
        .args(["apply", "--check", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(diff.as_bytes()).await?;
        drop(stdin);
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        Ok(true)
    } else {
        debug!(
            stderr = %String::from_utf8_lossy(&output.stderr),
            "Diff failed apply-check"
        );
        Ok(false)
    }
}

async fn run_git(cwd: &Path, args: &[&str]) -> Result<(), ExecutorError> {
    let output = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(ExecutorError::RepoPrepare(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&"?"),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
