//! Delay between retry attempts.
//!
//! # Policy
//!
//! - Delay before retry `n` (0-based): `initial_delay * 2^n`, capped at `max_delay`
//! - Down-jitter: multiply by a factor in `[1 - jitter_factor, 1.0]`
//! - `Backoff::NONE` retries immediately
//!
//! The delay counts against the task's deadline like any attempt does.

use std::time::Duration;

use crate::PolicyError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::NONE
    }
}

impl Backoff {
    pub const NONE: Self = Self {
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter_factor: 0.0,
    };

    /// Exponential backoff without jitter. `max_delay` is raised to
    /// `initial_delay` if it is smaller.
    #[must_use]
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            jitter_factor: 0.0,
        }
    }

    pub fn with_jitter(self, jitter_factor: f64) -> Result<Self, PolicyError> {
        if !(0.0..=1.0).contains(&jitter_factor) {
            return Err(PolicyError::InvalidJitter(jitter_factor));
        }
        Ok(Self {
            jitter_factor,
            ..self
        })
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        self.initial_delay.is_zero()
    }

    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub const fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Delay before the retry numbered `backoff_step` (0 before the first retry).
    ///
    /// `sample` is a uniform random value in `[0, 1)`; callers supply it so the
    /// computation stays deterministic here.
    #[must_use]
    pub fn delay_for(&self, backoff_step: u32, sample: f64) -> Duration {
        if self.is_none() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter = 1.0 - sample.clamp(0.0, 1.0) * self.jitter_factor;
        Duration::from_secs_f64(capped * jitter)
    }
}
