//! Per-step checkpoint commits.
//!
//! Each completed step is wrapped in an at-most-one commit of the workspace,
//! with a staged-diff check so a step that changed nothing never produces an
//! empty commit. A commit failure is fatal to the run: a partially committed
//! workspace is unsafe to resume automatically, so the committer never
//! retries on its own.

use async_trait::async_trait;
use conductor_core::{AgentKind, ConductorError, ConductorResult};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Collaborator contract consumed by the scheduler for checkpointing.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Commit the workspace changes attributable to one completed step.
    ///
    /// Returns `Ok(false)` when there is nothing to commit (not an error);
    /// `Err` only on an actual git failure.
    async fn commit_step(
        &self,
        workspace: &Path,
        run_id: Uuid,
        step_number: u32,
        agent: AgentKind,
    ) -> ConductorResult<bool>;

    /// Open a pull request for the run's branch. Invoked once, only after
    /// every step has completed.
    async fn open_pull_request(
        &self,
        workspace: &Path,
        run_id: Uuid,
        ticket_id: &str,
    ) -> ConductorResult<String>;
}

/// Checkpointer backed by the `git` (and optionally `gh`) CLI.
///
/// The stage/commit/push section is serialized behind a mutex so steps of a
/// parallel batch that complete concurrently never interleave git state in
/// the shared repository.
pub struct GitCheckpointer {
    push: bool,
    repo_lock: Mutex<()>,
}

impl GitCheckpointer {
    /// Creates a committer that commits locally without pushing.
    pub fn new() -> Self {
        Self {
            push: false,
            repo_lock: Mutex::new(()),
        }
    }

    /// Push each checkpoint commit to the configured upstream.
    pub fn with_push(mut self) -> Self {
        self.push = true;
        self
    }

    async fn run_git(&self, workspace: &Path, args: &[&str]) -> ConductorResult<Output> {
        Command::new("git")
            .args(args)
            .current_dir(workspace)
            .output()
            .await
            .map_err(|e| ConductorError::Checkpoint(format!("spawn git {}: {e}", args.join(" "))))
    }

    async fn run_git_checked(&self, workspace: &Path, args: &[&str]) -> ConductorResult<Output> {
        let output = self.run_git(workspace, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Checkpoint(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl Default for GitCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic commit message for one step checkpoint.
pub fn checkpoint_message(run_id: Uuid, step_number: u32, agent: AgentKind) -> String {
    format!("checkpoint(step-{step_number}): {agent} [run {run_id}]")
}

#[async_trait]
impl Checkpointer for GitCheckpointer {
    async fn commit_step(
        &self,
        workspace: &Path,
        run_id: Uuid,
        step_number: u32,
        agent: AgentKind,
    ) -> ConductorResult<bool> {
        let _guard = self.repo_lock.lock().await;

        self.run_git_checked(workspace, &["add", "-A"]).await?;

        // Exit code 0 means the staged tree matches HEAD, 1 means there are
        // staged changes; anything else is a real failure.
        let diff = self
            .run_git(workspace, &["diff", "--cached", "--quiet"])
            .await?;
        match diff.status.code() {
            Some(0) => {
                debug!(step = step_number, "no changes to checkpoint");
                return Ok(false);
            }
            Some(1) => {}
            _ => {
                let stderr = String::from_utf8_lossy(&diff.stderr);
                return Err(ConductorError::Checkpoint(format!(
                    "git diff --cached failed: {}",
                    stderr.trim()
                )));
            }
        }

        let message = checkpoint_message(run_id, step_number, agent);
        self.run_git_checked(workspace, &["commit", "-m", &message])
            .await?;

        if self.push {
            self.run_git_checked(workspace, &["push"]).await?;
        }

        info!(step = step_number, %agent, "checkpoint committed");
        Ok(true)
    }

    async fn open_pull_request(
        &self,
        workspace: &Path,
        run_id: Uuid,
        ticket_id: &str,
    ) -> ConductorResult<String> {
        let title = format!("{ticket_id}: automated delivery run");
        let body = format!("Checkpointed run `{run_id}` for ticket {ticket_id}.");
        let output = Command::new("gh")
            .args(["pr", "create", "--title", &title, "--body", &body])
            .current_dir(workspace)
            .output()
            .await
            .map_err(|e| ConductorError::Checkpoint(format!("spawn gh pr create: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConductorError::Checkpoint(format!(
                "gh pr create failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
