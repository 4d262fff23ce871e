//! GitCheckpointer against a real repository in a tempdir.

use conductor_core::AgentKind;
use conductor_scheduler::{Checkpointer, GitCheckpointer};
use std::path::Path;
use std::process::Command;
use uuid::Uuid;

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "ci@example.test"]);
    git(dir, &["config", "user.name", "ci"]);
}

fn commit_count(dir: &Path) -> usize {
    git(dir, &["rev-list", "--count", "HEAD"])
        .trim()
        .parse()
        .expect("commit count")
}

#[tokio::test]
async fn test_commit_step_commits_workspace_changes() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    std::fs::write(dir.path().join("login.rs"), "fn login() {}\n").unwrap();

    let committer = GitCheckpointer::new();
    let run_id = Uuid::new_v4();
    let committed = committer
        .commit_step(dir.path(), run_id, 1, AgentKind::Developer)
        .await
        .unwrap();

    assert!(committed);
    assert_eq!(commit_count(dir.path()), 1);
    let subject = git(dir.path(), &["log", "-1", "--format=%s"]);
    assert!(
        subject.starts_with("checkpoint(step-1): developer"),
        "subject: {subject}"
    );
}

#[tokio::test]
async fn test_unchanged_workspace_produces_no_commit() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path());
    std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();

    let committer = GitCheckpointer::new();
    let run_id = Uuid::new_v4();
    assert!(committer
        .commit_step(dir.path(), run_id, 1, AgentKind::Developer)
        .await
        .unwrap());

    // A step that touched nothing checkpoints nothing.
    let committed = committer
        .commit_step(dir.path(), run_id, 2, AgentKind::Qa)
        .await
        .unwrap();
    assert!(!committed);
    assert_eq!(commit_count(dir.path()), 1);
}

#[tokio::test]
async fn test_commit_outside_repository_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let committer = GitCheckpointer::new();
    let err = committer
        .commit_step(dir.path(), Uuid::new_v4(), 1, AgentKind::Developer)
        .await;
    assert!(err.is_err());
}
