//! Expiring task handles.
//!
//! A submitted task lives in a [`TaskCell`] shared by three parties: the worker
//! that runs it, the deadline watcher that may cancel it, and the caller's
//! [`TaskHandle`]. The cell's phase moves out of `Pending` exactly once; the
//! first transition wins and every later one is a no-op.
//!
//! ```text
//! Pending ──complete──▶ Completed
//!    │ ────cancel────▶ Cancelled
//!    │ ───interrupt──▶ Interrupted
//!    └────panic──────▶ Panicked
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures_util::future::AbortHandle;
use tokio::time::Instant;

use retrypool_types::{TaskError, TaskId};

/// Lifecycle phase of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Pending,
    /// The operation returned, successfully or not.
    Completed,
    Cancelled,
    Interrupted,
    Panicked,
}

impl TaskPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

struct Slot<T, E> {
    phase: TaskPhase,
    outcome: Option<Result<T, E>>,
    waker: Option<Waker>,
}

pub(crate) struct TaskCell<T, E> {
    id: TaskId,
    deadline: Option<Instant>,
    attempts: Arc<AtomicU32>,
    abort: AbortHandle,
    slot: Mutex<Slot<T, E>>,
}

impl<T, E> TaskCell<T, E> {
    pub(crate) fn new(
        id: TaskId,
        deadline: Option<Instant>,
        abort: AbortHandle,
        attempts: Arc<AtomicU32>,
    ) -> Self {
        Self {
            id,
            deadline,
            attempts,
            abort,
            slot: Mutex::new(Slot {
                phase: TaskPhase::Pending,
                outcome: None,
                waker: None,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn phase(&self) -> TaskPhase {
        self.slot().phase
    }

    /// Store the operation's result. Returns `false` if the task had already
    /// been cancelled or interrupted; the result is then dropped.
    pub(crate) fn complete(&self, result: Result<T, E>) -> bool {
        let waker = {
            let mut slot = self.slot();
            if slot.phase.is_terminal() {
                return false;
            }
            slot.phase = TaskPhase::Completed;
            slot.outcome = Some(result);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    pub(crate) fn cancel(&self) -> bool {
        self.finish_without_result(TaskPhase::Cancelled)
    }

    pub(crate) fn interrupt(&self) -> bool {
        self.finish_without_result(TaskPhase::Interrupted)
    }

    pub(crate) fn mark_panicked(&self) -> bool {
        self.finish_without_result(TaskPhase::Panicked)
    }

    fn finish_without_result(&self, phase: TaskPhase) -> bool {
        let waker = {
            let mut slot = self.slot();
            if slot.phase.is_terminal() {
                return false;
            }
            slot.phase = phase;
            slot.waker.take()
        };
        // Stops the work at its next await point; blocking work sees it
        // through its `CancelSignal`.
        self.abort.abort();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Result<T, TaskError<E>>> {
        let mut slot = self.slot();
        let outcome = match slot.phase {
            TaskPhase::Pending => {
                let registered = slot
                    .waker
                    .as_ref()
                    .is_some_and(|waker| waker.will_wake(cx.waker()));
                if !registered {
                    slot.waker = Some(cx.waker().clone());
                }
                return Poll::Pending;
            }
            TaskPhase::Completed => match slot.outcome.take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(err)) => Err(TaskError::Failed(err)),
                None => Err(TaskError::AlreadyJoined),
            },
            TaskPhase::Cancelled => Err(TaskError::Cancelled),
            TaskPhase::Interrupted => Err(TaskError::Interrupted),
            TaskPhase::Panicked => Err(TaskError::Panicked),
        };
        Poll::Ready(outcome)
    }
}

/// Type-erased view of a task used by the watcher and the in-flight registry,
/// which hold tasks of every result type side by side.
pub(crate) trait Expire: Send + Sync {
    fn id(&self) -> TaskId;
    fn is_done(&self) -> bool;
    fn cancel(&self) -> bool;
    fn interrupt(&self) -> bool;
}

impl<T: Send, E: Send> Expire for TaskCell<T, E> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn is_done(&self) -> bool {
        self.phase() == TaskPhase::Completed
    }

    fn cancel(&self) -> bool {
        TaskCell::cancel(self)
    }

    fn interrupt(&self) -> bool {
        TaskCell::interrupt(self)
    }
}

/// Cooperative cancellation flag handed to blocking operations.
///
/// Blocking code cannot be stopped from outside; it should poll
/// [`CancelSignal::is_cancelled`] at convenient points and bail out.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    abort: AbortHandle,
}

impl CancelSignal {
    pub(crate) fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    /// A signal that is never raised, for running operations outside a pool.
    #[must_use]
    pub fn never() -> Self {
        let (abort, _registration) = AbortHandle::new_pair();
        Self { abort }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.abort.is_aborted()
    }
}

/// Caller-side handle to a submitted task.
///
/// Await it (or call [`TaskHandle::join`]) to get the task's outcome. The
/// handle is `Unpin`, so `&mut handle` can be awaited under a timeout and
/// awaited again later. Dropping the handle detaches the task; it keeps
/// running and its deadline is still enforced.
pub struct TaskHandle<T, E> {
    cell: Arc<TaskCell<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new(cell: Arc<TaskCell<T, E>>) -> Self {
        Self { cell }
    }

    #[must_use]
    pub fn id(&self) -> TaskId {
        self.cell.id()
    }

    /// Absolute deadline, or `None` when the task has no timeout.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.cell.deadline()
    }

    /// Time left until the deadline, clamped to zero once it has passed.
    /// `None` means the task never expires.
    #[must_use]
    pub fn remaining_delay(&self) -> Option<Duration> {
        self.cell
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn phase(&self) -> TaskPhase {
        self.cell.phase()
    }

    /// True once the operation itself has finished, whether it succeeded or
    /// failed. A cancelled task is not done.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cell.phase() == TaskPhase::Completed
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cell.phase() == TaskPhase::Cancelled
    }

    /// True once the task has reached any final state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.phase().is_terminal()
    }

    /// Attempts started so far, including the one in progress.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.cell.attempts.load(Ordering::Acquire)
    }

    /// Cancel the task unless it already finished.
    ///
    /// Idempotent; returns whether this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }

    pub async fn join(self) -> Result<T, TaskError<E>> {
        self.await
    }

    /// Wait at most `timeout` for the outcome.
    ///
    /// On [`TaskError::TimedOut`] the task is left running and the handle can
    /// be awaited again.
    pub async fn join_timeout(&mut self, timeout: Duration) -> Result<T, TaskError<E>> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(TaskError::TimedOut))
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.cell.poll_outcome(cx)
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.cell.id())
            .field("phase", &self.cell.phase())
            .field("deadline", &self.cell.deadline())
            .finish_non_exhaustive()
    }
}
