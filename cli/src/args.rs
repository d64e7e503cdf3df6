//! Command-line arguments.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;

use retrypool_config::RetrypoolConfig;

#[derive(Debug, Parser)]
#[command(name = "retrypool", version)]
#[command(about = "Run a command under a bounded-retry, bounded-timeout task pool")]
#[command(
    long_about = "Run a command under a bounded-retry, bounded-timeout task pool.\n\n\
                  A non-zero exit status counts as a failed attempt; an attempt still \
                  running at the deadline is killed."
)]
pub struct Args {
    /// Read settings from this file instead of ~/.retrypool/config.toml
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Retries after the first failed attempt
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub retries: Option<i64>,

    /// Deadline per run in milliseconds (negative = none)
    #[arg(long, value_name = "MS", allow_negative_numbers = true)]
    pub timeout_ms: Option<i64>,

    /// Runs allowed in parallel
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Number of times to submit the command
    #[arg(long, value_name = "N", default_value = "1")]
    pub runs: NonZeroUsize,

    /// Program to run, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl Args {
    /// The program and its arguments. `command` is never empty after parsing.
    #[must_use]
    pub fn program(&self) -> (&str, &[String]) {
        match self.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => ("", &[]),
        }
    }

    /// Flags win over the config file and the environment.
    pub fn apply_to(&self, config: &mut RetrypoolConfig) {
        let pool = config.pool_mut();
        if let Some(retries) = self.retries {
            pool.retries = Some(retries);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            pool.timeout_ms = Some(timeout_ms);
        }
        if let Some(workers) = self.workers {
            pool.workers = Some(workers);
        }
    }
}
