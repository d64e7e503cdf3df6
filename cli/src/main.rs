//! retrypool CLI - run a command under a retryable pool.
//!
//! ```text
//! main() -> Args::parse -> load config -> env + flag overrides -> PoolSettings
//!                                                                    |
//!                                                                    v
//!                         RetryablePool::submit(run_command) x runs -> join all
//! ```
//!
//! Exit status: 0 when every run succeeded, 1 when any run failed, was
//! cancelled at its deadline or interrupted, 2 on usage or configuration
//! errors.

mod args;

use std::io;
use std::process::{ExitCode, ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use thiserror::Error;
use tokio::process::Command;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use retrypool_config::RetrypoolConfig;
use retrypool_core::{RetryablePool, TokioWorkerPool};

use crate::args::Args;

const DEFAULT_FILTER: &str = "info";

/// Why one attempt at the command failed.
#[derive(Debug, Error)]
enum CommandError {
    #[error("failed to start: {0}")]
    Spawn(#[source] io::Error),
    #[error("exited with {0}")]
    Exit(ExitStatus),
}

/// `RUST_LOG` first, then the config's `[logging] filter`, then `info`.
/// Logs go to stderr so the command's own stdout stays clean.
fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or(DEFAULT_FILTER)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

async fn run_command(program: Arc<str>, args: Arc<[String]>) -> Result<(), CommandError> {
    // Cancellation drops this future; kill_on_drop takes the child down with it.
    let status = Command::new(&*program)
        .args(args.iter())
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(CommandError::Spawn)?;

    if status.success() {
        Ok(())
    } else {
        Err(CommandError::Exit(status))
    }
}

/// Returns whether every run succeeded.
async fn run(args: Args) -> Result<bool> {
    let (mut config, load_error) = match &args.config {
        Some(path) => {
            let config = RetrypoolConfig::load_from(path)
                .with_context(|| format!("loading {}", path.display()))?;
            (config, None)
        }
        None => match RetrypoolConfig::load() {
            Ok(config) => (config.unwrap_or_default(), None),
            Err(err) => (RetrypoolConfig::default(), Some(err)),
        },
    };

    init_tracing(config.log_filter());
    if let Some(err) = load_error {
        tracing::warn!("{err}; using defaults");
    }

    config.apply_env_overrides()?;
    args.apply_to(&mut config);
    let settings = config.settings()?;

    let (program, program_args) = args.program();
    tracing::info!(
        program,
        runs = args.runs.get(),
        workers = settings.workers.get(),
        retries = settings.policy.retries.get(),
        timeout_ms = settings.policy.timeout.as_millis(),
        "Starting"
    );

    let workers = TokioWorkerPool::new(settings.workers.get())?;
    let pool = RetryablePool::with_settings(workers, settings.policy, settings.backoff)?;

    let program: Arc<str> = Arc::from(program);
    let program_args: Arc<[String]> = program_args.into();

    let mut handles = Vec::with_capacity(args.runs.get());
    for _ in 0..args.runs.get() {
        let program = Arc::clone(&program);
        let program_args = Arc::clone(&program_args);
        handles.push(pool.submit(move || {
            run_command(Arc::clone(&program), Arc::clone(&program_args))
        })?);
    }

    let mut all_succeeded = true;
    for mut handle in handles {
        let outcome = (&mut handle).await;
        let attempts = handle.attempts();
        match outcome {
            Ok(()) => tracing::info!(task = %handle.id(), attempts, "Run succeeded"),
            Err(err) => {
                all_succeeded = false;
                tracing::error!(task = %handle.id(), attempts, "Run failed: {err}");
            }
        }
    }

    pool.shutdown();
    Ok(all_succeeded)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with 2, `--help` with 0.
    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(2)
        }
    }
}
