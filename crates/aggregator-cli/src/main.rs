//! Aggregator - run-once controller for the periodic aggregation job
//!
//! The `aggregator` command is meant to be invoked by cron or another
//! scheduler once per period.
//!
//! ## Commands
//!
//! - `run`: stop the listener, run the aggregation script, resume the listener (default)
//! - `status`: show the last recorded attempt
//! - `clear`: remove the attempt record after an operator resolved a failure
//! - `probe`: run one collaborator script and report its exit code

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, Level};

use aggregator::{
    AggregationController, AggregatorConfig, ProcessRunner, ScriptRunner, StateStore,
};

#[derive(Parser)]
#[command(name = "aggregator")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run the aggregation job with the listener suspended", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Also append log lines to this file
    #[arg(long, global = true, env = "AGGREGATOR_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "AGGREGATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Settings that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Directory containing the collaborator scripts
    #[arg(long, global = true, env = "AGGREGATOR_SCRIPTS_DIR")]
    scripts_dir: Option<PathBuf>,

    /// Attempt state file (default: <scripts-dir>/aggregation_info)
    #[arg(long, global = true, env = "AGGREGATOR_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Aggregation script name or path
    #[arg(long, global = true, env = "AGGREGATOR_SCRIPT")]
    aggregation_script: Option<String>,

    /// Listener stop script name or path
    #[arg(long, global = true, env = "AGGREGATOR_STOP_LISTENER_SCRIPT")]
    stop_listener_script: Option<String>,

    /// Listener resume script name or path
    #[arg(long, global = true, env = "AGGREGATOR_RESUME_LISTENER_SCRIPT")]
    resume_listener_script: Option<String>,

    /// Aggregation timeout in seconds
    #[arg(long, global = true, env = "AGGREGATOR_TIMEOUT_SECS")]
    aggregation_timeout_secs: Option<u64>,

    /// Listener stop/resume timeout in seconds
    #[arg(long, global = true, env = "AGGREGATOR_LISTENER_TIMEOUT_SECS")]
    listener_timeout_secs: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut AggregatorConfig) {
        if let Some(dir) = self.scripts_dir {
            config.scripts_dir = dir;
        }
        if let Some(path) = self.state_file {
            config.state_file = Some(path);
        }
        if let Some(name) = self.aggregation_script {
            config.aggregation_script = name;
        }
        if let Some(name) = self.stop_listener_script {
            config.stop_listener_script = name;
        }
        if let Some(name) = self.resume_listener_script {
            config.resume_listener_script = name;
        }
        if let Some(secs) = self.aggregation_timeout_secs {
            config.aggregation_timeout_secs = secs;
        }
        if let Some(secs) = self.listener_timeout_secs {
            config.listener_timeout_secs = secs;
        }
    }
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run one aggregation (default when no command is given)
    Run,

    /// Show the last recorded aggregation attempt
    Status,

    /// Remove the attempt record so the next run may proceed
    Clear {
        /// Required when the record shows a failed or unreadable attempt
        #[arg(long)]
        yes: bool,
    },

    /// Run one collaborator script and exit with its code
    Probe {
        /// Script name (resolved against the scripts directory) or path
        script: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if let Err(e) = aggregator::init_tracing(cli.json, level, cli.log_file.as_deref()) {
        eprintln!("Failed to open log file: {e}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(exit_status(code)),
        Err(e) => {
            error!(error = format!("{e:#}"), "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let mut config =
        AggregatorConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.overrides.apply(&mut config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Status => cmd_status(&config, cli.json),
        Commands::Clear { yes } => cmd_clear(&config, yes),
        Commands::Probe { script } => cmd_probe(&config, &script).await,
    }
}

/// Map a script or outcome code onto a process exit status; out-of-range codes become 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

async fn cmd_run(config: &AggregatorConfig) -> Result<i32> {
    let shutdown = shutdown_signal().context("Failed to install signal handlers")?;
    run_until(config, shutdown).await
}

async fn run_until(config: &AggregatorConfig, shutdown: impl Future<Output = ()>) -> Result<i32> {
    let runner = ProcessRunner::for_host().context("Cannot run collaborator scripts")?;
    let controller = AggregationController::from_config(config, Arc::new(runner))
        .context("Invalid configuration")?;

    info!(state_file = %controller.store().path().display(), "Starting aggregation");
    let outcome = controller.run_until(shutdown).await?;
    Ok(outcome.exit_code())
}

/// Resolves on SIGINT or SIGTERM. Handlers are installed before returning.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => error!("SIGINT received"),
            _ = sigterm.recv() => error!("SIGTERM received"),
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => error!("Ctrl-C received"),
            Err(e) => {
                error!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await
            }
        }
    })
}

fn cmd_status(config: &AggregatorConfig, json: bool) -> Result<i32> {
    let store = StateStore::new(config.state_path());
    let record = store.load()?;

    if json {
        let body = match &record {
            Some(record) => json!({
                "state_file": store.path(),
                "time": record.timestamp().to_rfc3339(),
                "outcome": record.outcome().name(),
            }),
            None => json!({
                "state_file": store.path(),
                "time": null,
                "outcome": null,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        match &record {
            Some(record) => println!(
                "Last aggregation attempt: {} at {}",
                record.outcome().name(),
                record.timestamp()
            ),
            None => println!("No previous aggregation attempt recorded"),
        }
    }

    Ok(match record {
        Some(record) if record.is_failed() => 1,
        _ => 0,
    })
}

fn cmd_clear(config: &AggregatorConfig, yes: bool) -> Result<i32> {
    let store = StateStore::new(config.state_path());

    match store.load() {
        Ok(Some(record)) if record.is_failed() && !yes => anyhow::bail!(
            "Aggregation failed at {}; confirm it was resolved with --yes",
            record.timestamp()
        ),
        Err(e) if !yes => {
            return Err(
                anyhow::Error::new(e).context("State file is unreadable; pass --yes to remove it")
            );
        }
        _ => {}
    }

    if store.clear()? {
        info!(state_file = %store.path().display(), "Cleared aggregation attempt record");
        println!("Cleared {}", store.path().display());
    } else {
        println!("Nothing to clear at {}", store.path().display());
    }
    Ok(0)
}

async fn cmd_probe(config: &AggregatorConfig, script: &str) -> Result<i32> {
    let runner = ProcessRunner::for_host().context("Cannot run collaborator scripts")?;
    let path = config.script_path(script);
    let code = runner
        .run_for_exit_code(&path)
        .await
        .with_context(|| format!("Failed to run {}", path.display()))?;
    println!("{} exited with code {}", path.display(), code);
    Ok(code)
}
