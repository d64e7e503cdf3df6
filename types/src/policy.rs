//! Retry and timeout policy types.
//!
//! These types make the invalid settings of a retryable pool unrepresentable:
//! a negative retry count or a zero timeout cannot be constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PolicyError;

/// Number of additional attempts permitted after the first failure.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct RetryBudget(u32);

impl RetryBudget {
    /// A single attempt, no retries.
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn new(retries: u32) -> Self {
        Self(retries)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Upper bound on attempts: the initial try plus every retry.
    #[must_use]
    pub const fn attempts(self) -> u32 {
        self.0.saturating_add(1)
    }
}

impl TryFrom<i64> for RetryBudget {
    type Error = PolicyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(PolicyError::NegativeRetries(value));
        }
        u32::try_from(value)
            .map(Self)
            .map_err(|_| PolicyError::RetriesOutOfRange(value))
    }
}

impl From<RetryBudget> for i64 {
    fn from(value: RetryBudget) -> Self {
        i64::from(value.0)
    }
}

/// Wall-clock limit for a whole attempt sequence.
///
/// Expressed in milliseconds at the edges of the system: a positive value is
/// a bound, a negative value means "no limit", and zero is rejected because
/// it reads as either.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum TaskTimeout {
    #[default]
    Unbounded,
    Bounded(Duration),
}

impl TaskTimeout {
    /// Millisecond value reported for an unbounded timeout.
    pub const UNBOUNDED_MILLIS: i64 = -1;

    pub fn from_millis(millis: i64) -> Result<Self, PolicyError> {
        match millis {
            0 => Err(PolicyError::ZeroTimeout),
            m if m < 0 => Ok(Self::Unbounded),
            m => Ok(Self::Bounded(Duration::from_millis(m.unsigned_abs()))),
        }
    }

    pub fn bounded(duration: Duration) -> Result<Self, PolicyError> {
        if duration.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(Self::Bounded(duration))
    }

    #[must_use]
    pub const fn duration(self) -> Option<Duration> {
        match self {
            Self::Unbounded => None,
            Self::Bounded(duration) => Some(duration),
        }
    }

    #[must_use]
    pub const fn is_bounded(self) -> bool {
        matches!(self, Self::Bounded(_))
    }

    /// Milliseconds, with [`Self::UNBOUNDED_MILLIS`] standing in for no limit.
    ///
    /// Sub-millisecond bounds round up so a bounded timeout never reports zero.
    #[must_use]
    pub fn as_millis(self) -> i64 {
        match self {
            Self::Unbounded => Self::UNBOUNDED_MILLIS,
            Self::Bounded(duration) => {
                let millis = duration.as_millis().max(1);
                i64::try_from(millis).unwrap_or(i64::MAX)
            }
        }
    }
}

impl TryFrom<i64> for TaskTimeout {
    type Error = PolicyError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_millis(value)
    }
}

impl From<TaskTimeout> for i64 {
    fn from(value: TaskTimeout) -> Self {
        value.as_millis()
    }
}

/// The retry count and timeout that apply to one submission.
///
/// A pool copies its current policy into every task at submit time, so later
/// changes to the pool never reach tasks that are already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExecutionPolicy {
    pub retries: RetryBudget,
    pub timeout: TaskTimeout,
}

impl ExecutionPolicy {
    #[must_use]
    pub const fn new(retries: RetryBudget, timeout: TaskTimeout) -> Self {
        Self { retries, timeout }
    }

    /// Validate raw integers the way the pool's constructor and setters do.
    pub fn from_raw(retries: i64, timeout_millis: i64) -> Result<Self, PolicyError> {
        Ok(Self {
            retries: RetryBudget::try_from(retries)?,
            timeout: TaskTimeout::from_millis(timeout_millis)?,
        })
    }
}
