use thiserror::Error;

/// Rejected retry or timeout settings.
///
/// Raised synchronously by constructors and setters; a rejected value never
/// replaces the one already in effect.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PolicyError {
    #[error("retry count must not be negative (got {0})")]
    NegativeRetries(i64),
    #[error("retry count {0} exceeds the supported maximum of {max}", max = u32::MAX)]
    RetriesOutOfRange(i64),
    #[error(
        "timeout must be positive (bounded, in milliseconds) or negative (unbounded); zero is ambiguous"
    )]
    ZeroTimeout,
    #[error("backoff jitter factor must be within [0, 1] (got {0})")]
    InvalidJitter(f64),
}

/// Why awaiting a task handle did not produce the operation's value.
///
/// `Failed` carries the last attempt's error untouched, so callers can tell an
/// operation failure apart from the pool stepping in.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// The operation failed on every attempt the retry budget allowed.
    #[error("operation failed: {0}")]
    Failed(E),
    /// The task was cancelled before it finished, usually by its deadline.
    #[error("task cancelled before completion")]
    Cancelled,
    /// The caller's own wait elapsed; the task itself keeps running.
    #[error("timed out waiting for task result")]
    TimedOut,
    /// The pool shut down before the task ran to completion.
    #[error("task interrupted by pool shutdown")]
    Interrupted,
    #[error("task panicked")]
    Panicked,
    /// The result was already moved out by an earlier await.
    #[error("task result already taken")]
    AlreadyJoined,
}

impl<E> TaskError<E> {
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    #[must_use]
    pub const fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// The operation's own error, if that is what ended the task.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}
