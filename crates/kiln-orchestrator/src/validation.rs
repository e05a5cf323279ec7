//! Validation runner: apply a change set, then run the project's verification command
//!
//! Command selection: `.kiln/config.toml` first, then detection from the project
//! type. The test command wins over the check command.

use async_trait::async_trait;
use command_group::AsyncCommandGroup;
use kiln_agent::apply_change_set;
use kiln_core::{ChangeSet, RepoConfig, Result, ValidationReport};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::context::truncate_chars;
use crate::synthesis::repo_config_or_default;

pub const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_CHARS: usize = 4000;

/// Applies change sets and verifies the result
#[async_trait]
pub trait ChangeValidator: Send + Sync {
    /// Write every edit into the workspace, rejecting unsafe paths before any write
    async fn apply(&self, workspace: &Path, change_set: &ChangeSet) -> Result<()>;

    /// Run the project's verification command
    async fn validate(&self, workspace: &Path) -> Result<ValidationReport>;
}

/// Commands available for a project
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationCommands {
    pub test: Option<String>,
    pub check: Option<String>,
}

impl ValidationCommands {
    /// The command that will run: test first, then check
    pub fn preferred(&self) -> Option<&str> {
        self.test.as_deref().or(self.check.as_deref())
    }
}

/// Pick validation commands for the checkout at `workspace`
pub fn detect_commands(workspace: &Path, repo_config: &RepoConfig) -> ValidationCommands {
    let detected = detect_from_project(workspace);
    ValidationCommands {
        test: non_blank(repo_config.test_command.as_deref()).or(detected.test),
        check: non_blank(repo_config.check_command.as_deref()).or(detected.check),
    }
}

fn non_blank(command: Option<&str>) -> Option<String> {
    command
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

fn detect_from_project(workspace: &Path) -> ValidationCommands {
    let package_json = workspace.join("package.json");
    if package_json.exists() {
        return ValidationCommands {
            test: has_npm_test_script(&package_json).then(|| "npm test".to_string()),
            check: Some("npx tsc --noEmit".to_string()),
        };
    }

    if workspace.join("Cargo.toml").exists() {
        return ValidationCommands {
            test: Some("cargo test".to_string()),
            check: Some("cargo check".to_string()),
        };
    }

    if workspace.join("pyproject.toml").exists()
        || workspace.join("requirements.txt").exists()
        || workspace.join("setup.py").exists()
    {
        return ValidationCommands {
            test: Some("pytest".to_string()),
            check: Some("python -m compileall -q .".to_string()),
        };
    }

    if workspace.join("go.mod").exists() {
        return ValidationCommands {
            test: Some("go test ./...".to_string()),
            check: Some("go build ./...".to_string()),
        };
    }

    ValidationCommands::default()
}

fn has_npm_test_script(package_json: &Path) -> bool {
    std::fs::read_to_string(package_json)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .and_then(|json| {
            json.get("scripts")
                .and_then(|s| s.get("test"))
                .and_then(|t| t.as_str())
                .map(|t| !t.trim().is_empty())
        })
        .unwrap_or(false)
}

/// Run `command` through `sh -c` in `workspace`, bounded by `timeout`.
///
/// The shell runs as the leader of its own process group. On timeout the whole group
/// is killed, so background jobs and test-runner children do not outlive the attempt.
/// Spawn failures and timeouts are failed reports, not errors.
pub async fn run_command(workspace: &Path, command: &str, timeout: Duration) -> ValidationReport {
    info!(command, workspace = %workspace.display(), "Running validation command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.group_spawn() {
        Ok(child) => child,
        Err(e) => {
            return ValidationReport::failed(
                Some(command.to_string()),
                format!("Failed to run {}: {}", command, e),
            )
        }
    };

    let stdout = child.inner().stdout.take();
    let stderr = child.inner().stderr.take();

    // Pipes are read to EOF, so a descendant still holding them keeps this pending
    let finished = tokio::time::timeout(timeout, async {
        let (status, stdout, stderr) =
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
        status.map(|status| (status, stdout, stderr))
    })
    .await;

    let (status, stdout, stderr) = match finished {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return ValidationReport::failed(
                Some(command.to_string()),
                format!("Failed to run {}: {}", command, e),
            )
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!(command, error = %e, "Failed to kill timed-out validation process group");
            }
            return ValidationReport::failed(
                Some(command.to_string()),
                format!("{} timed out after {:?}", command, timeout),
            );
        }
    };

    if status.success() {
        debug!(command, "Validation passed");
        return ValidationReport::passed(command);
    }

    let stdout = String::from_utf8_lossy(&stdout);
    let stderr = String::from_utf8_lossy(&stderr);
    ValidationReport::failed(
        Some(command.to_string()),
        format!(
            "{} failed ({}):\n\nSTDOUT:\n{}\n\nSTDERR:\n{}",
            command,
            status,
            truncate_chars(stdout.trim(), MAX_OUTPUT_CHARS),
            truncate_chars(stderr.trim(), MAX_OUTPUT_CHARS)
        ),
    )
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Failed to read validation output");
        }
    }
    buf
}

/// Shell-command validator
#[derive(Debug, Clone)]
pub struct CommandValidator {
    timeout: Duration,
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_TIMEOUT)
    }
}

impl CommandValidator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ChangeValidator for CommandValidator {
    async fn apply(&self, workspace: &Path, change_set: &ChangeSet) -> Result<()> {
        let repo_config = repo_config_or_default(workspace);
        let result = apply_change_set(workspace, change_set, &repo_config.protected_files)?;
        info!(summary = %result.summary(), "Applied change set");
        Ok(())
    }

    async fn validate(&self, workspace: &Path) -> Result<ValidationReport> {
        let repo_config = repo_config_or_default(workspace);
        let commands = detect_commands(workspace, &repo_config);

        match commands.preferred() {
            Some(command) => Ok(run_command(workspace, command, self.timeout).await),
            None => Ok(ValidationReport::failed(
                None,
                "no validation command: configure test_command in .kiln/config.toml or add a \
                 recognised project manifest",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::FileEdit;
    use tempfile::TempDir;

    #[test]
    fn test_detect_node_with_and_without_test_script() {
        let temp_dir = TempDir::new().unwrap();
        let pkg = temp_dir.path().join("package.json");

        std::fs::write(&pkg, r#"{"scripts":{"test":"jest"}}"#).unwrap();
        let commands = detect_commands(temp_dir.path(), &RepoConfig::default());
        assert_eq!(commands.preferred(), Some("npm test"));

        std::fs::write(&pkg, r#"{"scripts":{"build":"tsc"}}"#).unwrap();
        let commands = detect_commands(temp_dir.path(), &RepoConfig::default());
        assert_eq!(commands.test, None);
        assert_eq!(commands.preferred(), Some("npx tsc --noEmit"));
    }

    #[test]
    fn test_detect_other_project_types() {
        for (manifest, expected) in [
            ("Cargo.toml", "cargo test"),
            ("pyproject.toml", "pytest"),
            ("go.mod", "go test ./..."),
        ] {
            let temp_dir = TempDir::new().unwrap();
            std::fs::write(temp_dir.path().join(manifest), "").unwrap();
            let commands = detect_commands(temp_dir.path(), &RepoConfig::default());
            assert_eq!(commands.preferred(), Some(expected), "{}", manifest);
        }
    }

    #[test]
    fn test_repo_config_overrides_detection() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("Cargo.toml"), "").unwrap();
        let config = RepoConfig {
            test_command: Some("make verify".to_string()),
            ..RepoConfig::default()
        };
        let commands = detect_commands(temp_dir.path(), &config);
        assert_eq!(commands.preferred(), Some("make verify"));
        assert_eq!(commands.check.as_deref(), Some("cargo check"));
    }

    #[tokio::test]
    async fn test_passing_command() {
        let temp_dir = TempDir::new().unwrap();
        let report = run_command(temp_dir.path(), "true", Duration::from_secs(10)).await;
        assert!(report.passed);
        assert_eq!(report.command.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_failing_command_captures_output() {
        let temp_dir = TempDir::new().unwrap();
        let report = run_command(
            temp_dir.path(),
            "echo 'expected 200' && echo 'got 404' >&2 && exit 3",
            Duration::from_secs(10),
        )
        .await;
        assert!(!report.passed);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("STDOUT:\nexpected 200"));
        assert!(diagnostic.contains("STDERR:\ngot 404"));
    }

    #[tokio::test]
    async fn test_timeout_is_failed_report() {
        let temp_dir = TempDir::new().unwrap();
        let report = run_command(temp_dir.path(), "sleep 5", Duration::from_millis(100)).await;
        assert!(!report.passed);
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("timed out after 100ms"), "{}", diagnostic);
    }

    /// Whether `pid` is a live (non-zombie) process
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next())
                .map(|state| state != 'Z')
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_background_descendants() {
        let temp_dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        let report = run_command(
            temp_dir.path(),
            "sleep 30 & echo $! > bg.pid; sleep 30",
            Duration::from_millis(300),
        )
        .await;
        assert!(!report.passed);
        assert!(report.diagnostic.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));

        let pid = std::fs::read_to_string(temp_dir.path().join("bg.pid")).unwrap();
        let pid = pid.trim().to_string();
        assert!(!pid.is_empty());

        let mut alive = true;
        for _ in 0..50 {
            if !is_running(&pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background sleep {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn test_detached_child_holding_output_does_not_outlive_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let started = std::time::Instant::now();
        // sh exits at once, the background job keeps stdout open
        let report = run_command(temp_dir.path(), "sleep 30 &", Duration::from_millis(300)).await;
        assert!(!report.passed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_no_command_fails_validation() {
        let temp_dir = TempDir::new().unwrap();
        let report = CommandValidator::default().validate(temp_dir.path()).await.unwrap();
        assert!(!report.passed);
        assert!(report.diagnostic.unwrap().contains("no validation command"));
    }

    #[tokio::test]
    async fn test_apply_honours_configured_protection() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".kiln")).unwrap();
        std::fs::write(
            temp_dir.path().join(".kiln/config.toml"),
            "protected_files = [\"migrations\"]\n",
        )
        .unwrap();

        let set: ChangeSet = vec![FileEdit::new("migrations/001.sql", "drop table users;")]
            .into_iter()
            .collect();
        let err = CommandValidator::default()
            .apply(temp_dir.path(), &set)
            .await
            .unwrap_err();
        assert!(err.is_attempt_scoped());
        assert!(!temp_dir.path().join("migrations/001.sql").exists());
    }

    #[tokio::test]
    async fn test_configured_command_runs() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".kiln")).unwrap();
        std::fs::write(
            temp_dir.path().join(".kiln/config.toml"),
            "test_command = \"test -f marker\"\n",
        )
        .unwrap();
        let validator = CommandValidator::new(Duration::from_secs(10));

        assert!(!validator.validate(temp_dir.path()).await.unwrap().passed);
        std::fs::write(temp_dir.path().join("marker"), "").unwrap();
        assert!(validator.validate(temp_dir.path()).await.unwrap().passed);
    }
}
