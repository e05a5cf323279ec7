//! Configuration management for Kiln
//!
//! Two layers:
//! - [`WorkerConfig`]: process-level settings read from the environment at startup
//! - [`RepoConfig`]: per-repository settings loaded from `.kiln/config.toml` in the
//!   target checkout (validation commands, protected files)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{KilnError, Result};

pub const ENV_NODE_TOKEN: &str = "KILN_NODE_TOKEN";
pub const ENV_GITHUB_TOKEN: &str = "KILN_GITHUB_TOKEN";
pub const ENV_GITHUB_TOKEN_FALLBACK: &str = "GITHUB_TOKEN";
pub const ENV_PROVIDER_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_COORDINATOR_URL: &str = "KILN_COORDINATOR_URL";
pub const ENV_POLL_INTERVAL: &str = "KILN_POLL_INTERVAL_SECS";
pub const ENV_WORK_DIR: &str = "KILN_WORK_DIR";
pub const ENV_HEARTBEAT_INTERVAL: &str = "KILN_HEARTBEAT_INTERVAL_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "KILN_MAX_ATTEMPTS";
pub const ENV_VALIDATION_TIMEOUT: &str = "KILN_VALIDATION_TIMEOUT_SECS";
pub const ENV_MODEL: &str = "KILN_MODEL";
pub const ENV_MAX_TOKENS: &str = "KILN_MAX_TOKENS";
pub const ENV_BASE_BRANCH: &str = "KILN_BASE_BRANCH";
pub const ENV_GIT_AUTHOR_NAME: &str = "KILN_GIT_AUTHOR_NAME";
pub const ENV_GIT_AUTHOR_EMAIL: &str = "KILN_GIT_AUTHOR_EMAIL";
pub const ENV_HTTP_TIMEOUT: &str = "KILN_HTTP_TIMEOUT_SECS";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_TOKENS: usize = 16000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Process-level worker configuration
#[derive(Clone)]
pub struct WorkerConfig {
    /// Bearer token for the coordinator
    pub node_token: String,
    /// Token for the version-control hosting service
    pub github_token: String,
    /// Key for the generative provider
    pub provider_key: String,
    /// Coordinator base URL, without trailing slash
    pub coordinator_url: String,
    pub poll_interval: Duration,
    /// Root directory for repository checkouts
    pub work_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// Upper bound on repair-loop attempts per task
    pub max_attempts: usize,
    pub validation_timeout: Duration,
    pub model: String,
    pub max_tokens: usize,
    /// Pull request base and fallback default branch
    pub base_branch: String,
    pub git_author_name: String,
    pub git_author_email: String,
    pub http_timeout: Duration,
}

impl WorkerConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Blank values count as missing. Required values missing, or optional values that
    /// fail to parse, produce a [`KilnError::Config`] naming the variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| {
            get(key).ok_or_else(|| KilnError::Config(format!("{} is required but not set", key)))
        };

        let node_token = required(ENV_NODE_TOKEN)?;
        let github_token = get(ENV_GITHUB_TOKEN)
            .or_else(|| get(ENV_GITHUB_TOKEN_FALLBACK))
            .ok_or_else(|| {
                KilnError::Config(format!(
                    "{} (or {}) is required but not set",
                    ENV_GITHUB_TOKEN, ENV_GITHUB_TOKEN_FALLBACK
                ))
            })?;
        let provider_key = required(ENV_PROVIDER_KEY)?;
        let coordinator_url = required(ENV_COORDINATOR_URL)?;
        if !coordinator_url.starts_with("http://") && !coordinator_url.starts_with("https://") {
            return Err(KilnError::Config(format!(
                "{} must be an http(s) URL, got '{}'",
                ENV_COORDINATOR_URL, coordinator_url
            )));
        }

        let poll_secs = parse_number(ENV_POLL_INTERVAL, get(ENV_POLL_INTERVAL), DEFAULT_POLL_INTERVAL_SECS)?;
        let heartbeat_secs = parse_number(
            ENV_HEARTBEAT_INTERVAL,
            get(ENV_HEARTBEAT_INTERVAL),
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )?;
        let max_attempts = parse_number(ENV_MAX_ATTEMPTS, get(ENV_MAX_ATTEMPTS), DEFAULT_MAX_ATTEMPTS)?;
        let validation_secs = parse_number(
            ENV_VALIDATION_TIMEOUT,
            get(ENV_VALIDATION_TIMEOUT),
            DEFAULT_VALIDATION_TIMEOUT_SECS,
        )?;
        let max_tokens = parse_number(ENV_MAX_TOKENS, get(ENV_MAX_TOKENS), DEFAULT_MAX_TOKENS)?;
        let http_secs = parse_number(ENV_HTTP_TIMEOUT, get(ENV_HTTP_TIMEOUT), DEFAULT_HTTP_TIMEOUT_SECS)?;

        let config = Self {
            node_token,
            github_token,
            provider_key,
            coordinator_url: coordinator_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(poll_secs),
            work_dir: get(ENV_WORK_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workspaces")),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            max_attempts,
            validation_timeout: Duration::from_secs(validation_secs),
            model: get(ENV_MODEL).unwrap_or_else(|| "sonnet".to_string()),
            max_tokens,
            base_branch: get(ENV_BASE_BRANCH).unwrap_or_else(|| "main".to_string()),
            git_author_name: get(ENV_GIT_AUTHOR_NAME).unwrap_or_else(|| "kiln-worker".to_string()),
            git_author_email: get(ENV_GIT_AUTHOR_EMAIL)
                .unwrap_or_else(|| "kiln-worker@users.noreply.github.com".to_string()),
            http_timeout: Duration::from_secs(http_secs),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges. Called by the loaders and again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(KilnError::Config(format!("{} must be at least 1", ENV_MAX_ATTEMPTS)));
        }
        if self.poll_interval.is_zero() {
            return Err(KilnError::Config(format!("{} must be at least 1", ENV_POLL_INTERVAL)));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(KilnError::Config(format!(
                "{} must be at least 1",
                ENV_HEARTBEAT_INTERVAL
            )));
        }
        if self.validation_timeout.is_zero() {
            return Err(KilnError::Config(format!(
                "{} must be at least 1",
                ENV_VALIDATION_TIMEOUT
            )));
        }
        if self.base_branch.is_empty() {
            return Err(KilnError::Config(format!("{} must not be empty", ENV_BASE_BRANCH)));
        }
        Ok(())
    }

    /// Human-readable summary with secrets masked
    pub fn redacted_summary(&self) -> String {
        format!(
            "coordinator_url     = {}\n\
             node_token          = {}\n\
             github_token        = {}\n\
             provider_key        = {}\n\
             work_dir            = {}\n\
             poll_interval       = {}s\n\
             heartbeat_interval  = {}s\n\
             max_attempts        = {}\n\
             validation_timeout  = {}s\n\
             model               = {}\n\
             max_tokens          = {}\n\
             base_branch         = {}\n\
             git_author          = {} <{}>\n\
             http_timeout        = {}s",
            self.coordinator_url,
            mask(&self.node_token),
            mask(&self.github_token),
            mask(&self.provider_key),
            self.work_dir.display(),
            self.poll_interval.as_secs(),
            self.heartbeat_interval.as_secs(),
            self.max_attempts,
            self.validation_timeout.as_secs(),
            self.model,
            self.max_tokens,
            self.base_branch,
            self.git_author_name,
            self.git_author_email,
            self.http_timeout.as_secs(),
        )
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("coordinator_url", &self.coordinator_url)
            .field("node_token", &mask(&self.node_token))
            .field("github_token", &mask(&self.github_token))
            .field("provider_key", &mask(&self.provider_key))
            .field("poll_interval", &self.poll_interval)
            .field("work_dir", &self.work_dir)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_attempts", &self.max_attempts)
            .field("validation_timeout", &self.validation_timeout)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("base_branch", &self.base_branch)
            .finish_non_exhaustive()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse::<T>().map_err(|_| {
            KilnError::Config(format!("{} must be a non-negative integer, got '{}'", key, value))
        }),
    }
}

/// Mask a secret, keeping only a short prefix for recognition
pub fn mask(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        "********".to_string()
    } else {
        let prefix: String = secret.chars().take(4).collect();
        format!("{}********", prefix)
    }
}

/// Repository-level Kiln configuration
///
/// Loaded from `.kiln/config.toml` in the checkout root. Every field is optional;
/// a missing file means "detect everything from the project layout".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Command that runs the project's tests (preferred validation)
    #[serde(default)]
    pub test_command: Option<String>,

    /// Type/compile check used when no test command exists
    #[serde(default)]
    pub check_command: Option<String>,

    /// Extra paths the provider may never write
    #[serde(default)]
    pub protected_files: Vec<String>,

    /// Files always included in the synthesis context
    #[serde(default)]
    pub context_files: Vec<String>,
}

impl RepoConfig {
    pub const RELATIVE_PATH: &'static str = ".kiln/config.toml";

    /// Load configuration from `.kiln/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(Self::RELATIVE_PATH);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                KilnError::Config(format!(
                    "Failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            (ENV_NODE_TOKEN, "node-secret-token"),
            (ENV_GITHUB_TOKEN, "ghp_abcdefghijkl"),
            (ENV_PROVIDER_KEY, "sk-ant-api03-xyz"),
            (ENV_COORDINATOR_URL, "https://coord.example.com/api/"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<WorkerConfig> {
        WorkerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_applied() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.coordinator_url, "https://coord.example.com/api");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.work_dir, PathBuf::from("./workspaces"));
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.model, "sonnet");
    }

    #[test]
    fn test_missing_required_names_variable() {
        for key in [ENV_NODE_TOKEN, ENV_PROVIDER_KEY, ENV_COORDINATOR_URL] {
            let mut env = base_env();
            env.remove(key);
            let err = load(&env).unwrap_err();
            assert!(matches!(err, KilnError::Config(_)));
            assert!(err.to_string().contains(key), "{} not named in {}", key, err);
        }
    }

    #[test]
    fn test_github_token_fallback() {
        let mut env = base_env();
        env.remove(ENV_GITHUB_TOKEN);
        assert!(load(&env).is_err());

        env.insert(ENV_GITHUB_TOKEN_FALLBACK, "ghp_fallback_token");
        assert_eq!(load(&env).unwrap().github_token, "ghp_fallback_token");
    }

    #[test]
    fn test_blank_value_counts_as_missing() {
        let mut env = base_env();
        env.insert(ENV_NODE_TOKEN, "   ");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut env = base_env();
        env.insert(ENV_POLL_INTERVAL, "soon");
        assert!(load(&env).unwrap_err().to_string().contains(ENV_POLL_INTERVAL));

        let mut env = base_env();
        env.insert(ENV_MAX_ATTEMPTS, "0");
        assert!(load(&env).unwrap_err().to_string().contains(ENV_MAX_ATTEMPTS));
    }

    #[test]
    fn test_overrides_parsed() {
        let mut env = base_env();
        env.insert(ENV_POLL_INTERVAL, "2");
        env.insert(ENV_WORK_DIR, "/var/lib/kiln");
        env.insert(ENV_MAX_ATTEMPTS, "5");
        let config = load(&env).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/kiln"));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn test_non_http_coordinator_rejected() {
        let mut env = base_env();
        env.insert(ENV_COORDINATOR_URL, "coord.example.com");
        assert!(load(&env).is_err());
    }

    #[test]
    fn test_secrets_never_rendered() {
        let config = load(&base_env()).unwrap();
        let summary = config.redacted_summary();
        let debug = format!("{:?}", config);
        for rendered in [summary, debug] {
            assert!(!rendered.contains("node-secret-token"));
            assert!(!rendered.contains("ghp_abcdefghijkl"));
            assert!(!rendered.contains("sk-ant-api03-xyz"));
        }
    }

    #[test]
    fn test_repo_config_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config = RepoConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config, RepoConfig::default());
    }

    #[test]
    fn test_repo_config_parsed() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".kiln")).unwrap();
        std::fs::write(
            temp_dir.path().join(".kiln/config.toml"),
            "test_command = \"make test\"\nprotected_files = [\"secrets.json\"]\n",
        )
        .unwrap();

        let config = RepoConfig::load_or_default(temp_dir.path()).unwrap();
        assert_eq!(config.test_command.as_deref(), Some("make test"));
        assert!(config.check_command.is_none());
        assert_eq!(config.protected_files, vec!["secrets.json"]);
    }

    #[test]
    fn test_repo_config_invalid_toml() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".kiln")).unwrap();
        std::fs::write(temp_dir.path().join(".kiln/config.toml"), "test_command = [").unwrap();
        assert!(RepoConfig::load_or_default(temp_dir.path()).is_err());
    }
}
