//! Configuration for retrypool.
//!
//! Read from `~/.retrypool/config.toml`:
//!
//! ```toml
//! [pool]
//! workers = 4
//! retries = 2
//! timeout_ms = 5000    # negative = unbounded, 0 is rejected
//!
//! [backoff]
//! initial_delay_ms = 100
//! max_delay_ms = 8000
//! jitter = 0.25
//!
//! [logging]
//! filter = "info"
//! ```
//!
//! Every field is optional. `RETRYPOOL_WORKERS`, `RETRYPOOL_RETRIES` and
//! `RETRYPOOL_TIMEOUT_MS` override the `[pool]` values. Nothing is validated
//! until [`RetrypoolConfig::settings`].

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, io, thread};

use serde::Deserialize;
use thiserror::Error;

use retrypool_types::{Backoff, ExecutionPolicy, PolicyError, TaskTimeout};

pub const ENV_WORKERS: &str = "RETRYPOOL_WORKERS";
pub const ENV_RETRIES: &str = "RETRYPOOL_RETRIES";
pub const ENV_TIMEOUT_MS: &str = "RETRYPOOL_TIMEOUT_MS";

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RetrypoolConfig {
    pub pool: Option<PoolConfig>,
    pub backoff: Option<BackoffConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PoolConfig {
    /// Worker pool width. Default: available parallelism.
    pub workers: Option<usize>,
    /// Retries after the first failed attempt. Default: 0.
    pub retries: Option<i64>,
    /// Per-task deadline in milliseconds. Default: unbounded.
    pub timeout_ms: Option<i64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry. Absent or zero disables backoff.
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    /// Down-jitter factor in `[0, 1]`.
    pub jitter: Option<f64>,
}

impl BackoffConfig {
    fn to_backoff(&self) -> Result<Backoff, PolicyError> {
        let initial = Duration::from_millis(self.initial_delay_ms.unwrap_or(0));
        if initial.is_zero() {
            return Ok(Backoff::NONE);
        }
        let max = self
            .max_delay_ms
            .map_or(DEFAULT_MAX_DELAY, Duration::from_millis);
        Backoff::exponential(initial, max).with_jitter(self.jitter.unwrap_or(0.0))
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

/// Validated settings, ready to build a pool from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSettings {
    pub workers: NonZeroUsize,
    pub policy: ExecutionPolicy,
    pub backoff: Backoff,
}

impl RetrypoolConfig {
    /// Load the user config. A missing file is `Ok(None)`; the caller decides
    /// whether a broken one is fatal.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides_with(|key| env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_overrides_with<L>(&mut self, lookup: L) -> Result<(), ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_WORKERS) {
            self.pool_mut().workers = Some(parse_override(ENV_WORKERS, &value)?);
        }
        if let Some(value) = lookup(ENV_RETRIES) {
            self.pool_mut().retries = Some(parse_override(ENV_RETRIES, &value)?);
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            self.pool_mut().timeout_ms = Some(parse_override(ENV_TIMEOUT_MS, &value)?);
        }
        Ok(())
    }

    pub fn pool_mut(&mut self) -> &mut PoolConfig {
        self.pool.get_or_insert_with(PoolConfig::default)
    }

    #[must_use]
    pub fn log_filter(&self) -> Option<&str> {
        self.logging.as_ref()?.filter.as_deref()
    }

    /// Validate into [`PoolSettings`], filling in defaults.
    pub fn settings(&self) -> Result<PoolSettings, ConfigError> {
        let pool = self.pool.clone().unwrap_or_default();

        let workers = match pool.workers {
            Some(workers) => NonZeroUsize::new(workers).ok_or(ConfigError::Invalid {
                key: "pool.workers",
                value: workers.to_string(),
            })?,
            None => thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        };
        let policy = ExecutionPolicy::from_raw(
            pool.retries.unwrap_or(0),
            pool.timeout_ms.unwrap_or(TaskTimeout::UNBOUNDED_MILLIS),
        )?;
        let backoff = match &self.backoff {
            Some(backoff) => backoff.to_backoff()?,
            None => Backoff::NONE,
        };

        Ok(PoolSettings {
            workers,
            policy,
            backoff,
        })
    }
}

fn parse_override<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".retrypool").join("config.toml"))
}
