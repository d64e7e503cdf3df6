//! Retry wrapper for fallible operations.
//!
//! # Retry Policy
//!
//! - Attempts: at most `retries + 1`
//! - The first success is returned at once; the remaining budget is unused
//! - Once the budget is spent, the **last** attempt's error is returned;
//!   earlier errors are logged and dropped
//! - Between attempts the configured [`Backoff`] is applied (none by default)
//!
//! Attempts run sequentially on the caller's task. Each attempt calls the
//! operation afresh; any state shared between attempts is the operation's own.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use retrypool_types::{Backoff, RetryBudget};

use crate::handle::CancelSignal;

/// How often a blocking backoff sleep checks for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct RetryWrapper<F> {
    operation: F,
    budget: RetryBudget,
    backoff: Backoff,
    attempts: Arc<AtomicU32>,
}

impl<F> RetryWrapper<F> {
    #[must_use]
    pub fn new(operation: F, budget: RetryBudget) -> Self {
        Self {
            operation,
            budget,
            backoff: Backoff::NONE,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn budget(&self) -> RetryBudget {
        self.budget
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Shared counter so a task handle can report attempts while the wrapper
    /// is running (or after it was dropped mid-attempt).
    pub(crate) fn attempt_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }

    fn start_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    /// Decide what follows a failed attempt: `Some(delay)` to retry after
    /// `delay`, `None` when the budget is exhausted.
    fn next_retry(&self, retry_count: u32, error: &impl Display) -> Option<Duration> {
        if retry_count >= self.budget.get() {
            tracing::debug!(
                error = %error,
                attempts = retry_count + 1,
                "Retry budget exhausted"
            );
            return None;
        }

        let delay = self.backoff.delay_for(retry_count, rand::random::<f64>());
        tracing::debug!(
            error = %error,
            retry_count = retry_count + 1,
            delay_ms = delay.as_millis(),
            "Retrying operation after failure"
        );
        Some(delay)
    }

    /// Run an async operation until it succeeds or the budget is spent.
    pub async fn invoke<T, E, Fut>(mut self) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut retry_count = 0;
        loop {
            self.start_attempt();
            let error = match (self.operation)().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(delay) = self.next_retry(retry_count, &error) else {
                return Err(error);
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retry_count += 1;
        }
    }

    /// Run a blocking operation until it succeeds, the budget is spent, or
    /// `signal` reports cancellation. In the last case the most recent error
    /// is returned without starting another attempt.
    pub fn invoke_blocking<T, E>(mut self, signal: &CancelSignal) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
    {
        let mut retry_count = 0;
        loop {
            self.start_attempt();
            let error = match (self.operation)() {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(delay) = self.next_retry(retry_count, &error) else {
                return Err(error);
            };
            if !sleep_unless_cancelled(delay, signal) {
                tracing::debug!(
                    attempts = retry_count + 1,
                    "Cancelled between attempts; not retrying"
                );
                return Err(error);
            }
            retry_count += 1;
        }
    }
}

/// Sleep for `delay` in short slices. Returns `false` as soon as `signal`
/// reports cancellation, including before the first slice.
fn sleep_unless_cancelled(delay: Duration, signal: &CancelSignal) -> bool {
    let deadline = Instant::now().checked_add(delay);
    loop {
        if signal.is_cancelled() {
            return false;
        }
        // A delay past the clock's range never ends.
        let left = deadline.map_or(CANCEL_POLL_INTERVAL, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(CANCEL_POLL_INTERVAL));
    }
}
