//! Kiln CLI - autonomous task worker
//!
//! Usage:
//!   kiln run                 Poll the coordinator and execute tasks until stopped
//!   kiln once                Run a single poll-and-execute cycle
//!   kiln check-config        Validate the environment and print the effective config
//!   kiln validate <path>     Run the validation command for a local checkout

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kiln_agent::{AnthropicProvider, Model};
use kiln_coordinator::CoordinatorClient;
use kiln_core::WorkerConfig;
use kiln_git::{GitCommand, GitHubClient, WorkspaceManager};
use kiln_orchestrator::{
    detect_commands, ChangeValidator, CommandValidator, Publisher, SynthesisEngine, TaskExecutor,
    TaskPipeline, Worker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Autonomous task worker: claim, generate, validate, publish")]
struct Cli {
    /// Enable verbose logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for tasks and execute them until SIGINT/SIGTERM
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Poll once and execute the claimed task, if any
    Once {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Validate the environment and print the effective configuration
    CheckConfig {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Run the validation command for a local checkout
    Validate {
        /// Checkout to validate
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Command timeout in seconds
        #[arg(long, default_value = "120")]
        timeout: u64,
    },
}

/// Command-line overrides for environment configuration
#[derive(clap::Args, Default)]
struct Overrides {
    /// Idle poll interval in seconds
    #[arg(long, value_name = "SECS")]
    poll_interval: Option<u64>,

    /// Root directory for repository checkouts
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Maximum repair-loop attempts per task
    #[arg(long, value_name = "N")]
    max_attempts: Option<usize>,
}

impl Overrides {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(secs) = self.poll_interval {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(max) = self.max_attempts {
            config.max_attempts = max;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { overrides } => cmd_run(&overrides).await,
        Commands::Once { overrides } => cmd_once(&overrides).await,
        Commands::CheckConfig { overrides } => cmd_check_config(&overrides),
        Commands::Validate { path, timeout } => cmd_validate(path, timeout).await,
    }
}

fn load_config(overrides: &Overrides) -> Result<WorkerConfig> {
    let mut config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    overrides.apply(&mut config);
    config
        .validate()
        .context("Invalid worker configuration after command-line overrides")?;
    Ok(config)
}

fn parse_model(name: &str) -> Result<Model> {
    name.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn build_worker(config: &WorkerConfig) -> Result<Worker<CoordinatorClient, impl TaskExecutor>> {
    let model = parse_model(&config.model)?;

    let coordinator = CoordinatorClient::new(
        &config.coordinator_url,
        &config.node_token,
        config.http_timeout,
    )
    .context("Failed to create coordinator client")?;

    let git = GitCommand::new(&config.git_author_name, &config.git_author_email)
        .with_secret(&config.github_token);

    let workspaces = WorkspaceManager::new(git.clone(), &config.work_dir)
        .with_token(&config.github_token)
        .with_fallback_branch(&config.base_branch);

    let provider =
        AnthropicProvider::new(&config.provider_key, model).with_max_tokens(config.max_tokens);

    let hosting = GitHubClient::new(&config.github_token, config.http_timeout)
        .context("Failed to create hosting client")?;

    let pipeline = TaskPipeline::new(
        workspaces,
        SynthesisEngine::new(provider, git.clone()),
        CommandValidator::new(config.validation_timeout),
        Publisher::new(git, hosting, &config.base_branch),
    )
    .with_max_attempts(config.max_attempts);

    Ok(Worker::new(Arc::new(coordinator), pipeline)
        .with_poll_interval(config.poll_interval)
        .with_heartbeat_interval(config.heartbeat_interval))
}

async fn cmd_run(overrides: &Overrides) -> Result<()> {
    let config = load_config(overrides)?;
    info!(
        coordinator = %config.coordinator_url,
        work_dir = %config.work_dir.display(),
        model = %config.model,
        "Starting Kiln worker"
    );

    let worker = build_worker(&config)?;
    spawn_shutdown_handler(worker.cancellation_token());
    worker.run().await;
    Ok(())
}

async fn cmd_once(overrides: &Overrides) -> Result<()> {
    let config = load_config(overrides)?;
    let worker = build_worker(&config)?;

    if worker.run_once().await {
        info!("Task processed");
    } else {
        info!("No work available");
    }
    Ok(())
}

fn cmd_check_config(overrides: &Overrides) -> Result<()> {
    let config = load_config(overrides)?;
    let model = parse_model(&config.model)?;

    println!("{}", config.redacted_summary());
    println!("model_id            = {}", model.api_name());
    println!("\nConfiguration OK");
    Ok(())
}

async fn cmd_validate(path: PathBuf, timeout: u64) -> Result<()> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Cannot access {}", path.display()))?;
    let repo_config = kiln_core::RepoConfig::load_or_default(&path)
        .with_context(|| format!("Invalid .kiln/config.toml in {}", path.display()))?;

    let commands = detect_commands(&path, &repo_config);
    println!("test command:  {}", commands.test.as_deref().unwrap_or("-"));
    println!("check command: {}", commands.check.as_deref().unwrap_or("-"));

    let report = CommandValidator::new(Duration::from_secs(timeout))
        .validate(&path)
        .await?;

    if report.passed {
        println!(
            "\nValidation passed ({})",
            report.command.as_deref().unwrap_or("no command")
        );
        Ok(())
    } else {
        println!(
            "\n{}",
            report.diagnostic.as_deref().unwrap_or("validation failed")
        );
        anyhow::bail!("Validation failed for {}", path.display())
    }
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_shutdown_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("Shutdown requested; the current task (if any) will finish first");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only Ctrl-C will stop the worker");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
