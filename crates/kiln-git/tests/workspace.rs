//! WorkspaceManager against real git repositories on disk

use kiln_git::{GitCommand, GitExecutor, WorkspaceManager};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=fixture", "-c", "user.email=fixture@example.com"])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

/// A non-bare origin repository with one commit on `main`
fn origin_repo(root: &Path) -> std::path::PathBuf {
    let origin = root.join("fixtures").join("origin-repo");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "-q"]);
    git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    std::fs::write(origin.join("README.md"), "# fixture\n").unwrap();
    git(&origin, &["add", "README.md"]);
    git(&origin, &["commit", "-q", "-m", "initial"]);
    origin
}

#[tokio::test]
async fn prepare_is_idempotent_on_real_repository() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let origin = origin_repo(temp_dir.path());
    let work_dir = temp_dir.path().join("workspaces");
    let executor = GitCommand::new("kiln-test", "kiln-test@example.com");
    let manager = WorkspaceManager::new(executor.clone(), &work_dir);
    let url = origin.to_str().unwrap();

    let first = manager.prepare(url, "auto/health-endpoint").await.unwrap();
    assert!(first.join("README.md").exists());

    // Leave junk behind; the second prepare must discard it
    std::fs::write(first.join("scratch.txt"), "leftover").unwrap();

    let second = manager.prepare(url, "auto/health-endpoint").await.unwrap();
    assert_eq!(first, second);
    assert!(!second.join("scratch.txt").exists());

    let head = executor
        .exec(&second, &["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap();
    assert_eq!(head.stdout.trim(), "auto/health-endpoint");
}

#[tokio::test]
async fn unreachable_repository_is_an_error() {
    if !git_available() {
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let executor = GitCommand::new("kiln-test", "kiln-test@example.com");
    let manager = WorkspaceManager::new(executor, temp_dir.path().join("workspaces"));

    let missing = temp_dir.path().join("nowhere").join("missing-repo");
    let result = manager
        .prepare(missing.to_str().unwrap(), "auto/x")
        .await;
    assert!(result.is_err());
}
