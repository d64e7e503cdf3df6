//! The retryable pool.
//!
//! ```text
//! submit(op) ─▶ snapshot policy ─▶ RetryWrapper ─▶ Abortable work ─▶ WorkerPool
//!                                        │
//!                     bounded timeout? ──┴─▶ DeadlineQueue ◀── watcher task
//! ```
//!
//! Every submission copies the pool's current [`ExecutionPolicy`]; changing
//! the retry count or timeout afterwards only affects later submissions.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::{self, Future};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::{AbortHandle, Abortable, Aborted};
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::time::Instant;

use retrypool_types::{
    Backoff, ExecutionPolicy, PolicyError, RetryBudget, TaskId, TaskTimeout,
};

use crate::handle::{CancelSignal, Expire, TaskCell, TaskHandle};
use crate::retry::RetryWrapper;
use crate::watcher::{DeadlineQueue, watch_deadlines};
use crate::workers::{TokioWorkerPool, WorkerPool};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("retryable pool needs a tokio runtime for its deadline watcher: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("pool is shut down; task rejected")]
    ShutDown,
}

/// Tasks dispatched and not yet finished, for `shutdown_now`.
#[derive(Default)]
struct InFlight {
    tasks: Mutex<HashMap<TaskId, Arc<dyn Expire>>>,
}

impl InFlight {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<dyn Expire>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, task: Arc<dyn Expire>) {
        self.tasks().insert(task.id(), task);
    }

    fn remove(&self, id: TaskId) {
        self.tasks().remove(&id);
    }

    fn len(&self) -> usize {
        self.tasks().len()
    }

    fn drain(&self) -> Vec<Arc<dyn Expire>> {
        self.tasks().drain().map(|(_, task)| task).collect()
    }
}

/// RAII guard owned by every job.
///
/// Unregisters the task when the job ends, and interrupts it if the job ended
/// without resolving it (dropped from a worker queue, runtime shutdown).
struct JobGuard {
    task: Arc<dyn Expire>,
    in_flight: Arc<InFlight>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.in_flight.remove(self.task.id());
        if self.task.interrupt() {
            tracing::debug!(task = %self.task.id(), "Job dropped before finishing; task interrupted");
        }
    }
}

async fn run_job<T, E, Fut>(cell: Arc<TaskCell<T, E>>, work: Abortable<Fut>, guard: JobGuard)
where
    Fut: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(result)) => {
            cell.complete(result);
        }
        // Cancelled or interrupted: whoever aborted the work already set the phase.
        Ok(Err(Aborted)) => {}
        Err(_panic) => {
            if cell.mark_panicked() {
                tracing::warn!(task = %cell.id(), "Task panicked");
            }
        }
    }
    drop(guard);
}

/// Worker pool decorator that retries failed tasks and enforces a deadline
/// over each task's whole attempt sequence.
pub struct RetryablePool<P = TokioWorkerPool> {
    workers: P,
    policy: RwLock<ExecutionPolicy>,
    backoff: Backoff,
    deadlines: Arc<DeadlineQueue>,
    in_flight: Arc<InFlight>,
    watcher: AbortHandle,
    next_id: AtomicU64,
}

impl<P: WorkerPool> RetryablePool<P> {
    /// Build a pool from raw settings: `retries >= 0`; `timeout_millis > 0`
    /// bounds every task, `< 0` leaves tasks unbounded, `0` is rejected.
    ///
    /// Starts the deadline watcher on the current tokio runtime.
    pub fn new(workers: P, retries: i64, timeout_millis: i64) -> Result<Self, PoolError> {
        let policy = ExecutionPolicy::from_raw(retries, timeout_millis)?;
        Self::with_settings(workers, policy, Backoff::NONE)
    }

    pub fn with_settings(
        workers: P,
        policy: ExecutionPolicy,
        backoff: Backoff,
    ) -> Result<Self, PoolError> {
        let runtime = Handle::try_current()?;
        let deadlines = Arc::new(DeadlineQueue::new());

        let (watcher, registration) = AbortHandle::new_pair();
        runtime.spawn(Abortable::new(
            watch_deadlines(Arc::clone(&deadlines)),
            registration,
        ));

        tracing::debug!(
            retries = policy.retries.get(),
            timeout_ms = policy.timeout.as_millis(),
            "Retryable pool started"
        );

        Ok(Self {
            workers,
            policy: RwLock::new(policy),
            backoff,
            deadlines,
            in_flight: Arc::new(InFlight::default()),
            watcher,
            next_id: AtomicU64::new(1),
        })
    }

    #[must_use]
    pub fn workers(&self) -> &P {
        &self.workers
    }

    /// The policy the next submission will use.
    #[must_use]
    pub fn policy(&self) -> ExecutionPolicy {
        *self.policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_policy(&self, policy: ExecutionPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }

    fn update_policy(&self, update: impl FnOnce(&mut ExecutionPolicy)) {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut policy);
    }

    #[must_use]
    pub fn retries(&self) -> RetryBudget {
        self.policy().retries
    }

    /// Replace the retry count for later submissions. Negative values are
    /// rejected and leave the current count in place.
    pub fn set_retries(&self, retries: i64) -> Result<(), PolicyError> {
        let budget = RetryBudget::try_from(retries)?;
        self.update_policy(|policy| policy.retries = budget);
        Ok(())
    }

    #[must_use]
    pub fn timeout(&self) -> TaskTimeout {
        self.policy().timeout
    }

    /// Replace the timeout for later submissions, in milliseconds: positive
    /// bounds, negative means unbounded, zero is rejected.
    pub fn set_timeout(&self, timeout_millis: i64) -> Result<(), PolicyError> {
        let timeout = TaskTimeout::from_millis(timeout_millis)?;
        self.update_policy(|policy| policy.timeout = timeout);
        Ok(())
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Submit an async operation. Returns at once; await the handle for the
    /// outcome.
    pub fn submit<F, Fut, T, E>(&self, operation: F) -> Result<TaskHandle<T, E>, SubmitError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let policy = self.policy();
        let wrapper = RetryWrapper::new(operation, policy.retries).with_backoff(self.backoff);

        let (abort, registration) = AbortHandle::new_pair();
        let cell = self.new_cell(policy.timeout, abort, wrapper.attempt_counter());
        let work = Abortable::new(wrapper.invoke(), registration);
        self.dispatch(cell, work)
    }

    /// Submit a blocking operation, run on tokio's blocking threads.
    ///
    /// Blocking code cannot be aborted from outside: on cancellation the
    /// handle resolves at once, while the operation keeps running until it
    /// notices the [`CancelSignal`] it is given.
    ///
    /// The worker slot is released when the handle resolves, not when the
    /// blocking thread returns. Operations that ignore the signal can
    /// therefore keep more blocking threads busy than the pool's width.
    pub fn submit_blocking<F, T, E>(
        &self,
        mut operation: F,
    ) -> Result<TaskHandle<T, E>, SubmitError>
    where
        F: FnMut(&CancelSignal) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let policy = self.policy();
        let (abort, registration) = AbortHandle::new_pair();
        let signal = CancelSignal::new(abort.clone());

        let attempt_signal = signal.clone();
        let wrapper = RetryWrapper::new(move || operation(&attempt_signal), policy.retries)
            .with_backoff(self.backoff);
        let cell = self.new_cell(policy.timeout, abort, wrapper.attempt_counter());

        let blocking = async move {
            match tokio::task::spawn_blocking(move || wrapper.invoke_blocking(&signal)).await {
                Ok(result) => result,
                Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
                // Runtime shutting down; dropping this job interrupts the task.
                Err(_) => future::pending().await,
            }
        };
        self.dispatch(cell, Abortable::new(blocking, registration))
    }

    fn new_cell<T, E>(
        &self,
        timeout: TaskTimeout,
        abort: AbortHandle,
        attempts: Arc<AtomicU32>,
    ) -> Arc<TaskCell<T, E>> {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let deadline = timeout
            .duration()
            .and_then(|timeout| Instant::now().checked_add(timeout));
        Arc::new(TaskCell::new(id, deadline, abort, attempts))
    }

    fn dispatch<T, E, Fut>(
        &self,
        cell: Arc<TaskCell<T, E>>,
        work: Abortable<Fut>,
    ) -> Result<TaskHandle<T, E>, SubmitError>
    where
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let id = cell.id();
        let task: Arc<dyn Expire> = cell.clone();

        // Register before dispatch: a fast job unregisters itself on completion.
        self.in_flight.insert(Arc::clone(&task));
        let guard = JobGuard {
            task: Arc::clone(&task),
            in_flight: Arc::clone(&self.in_flight),
        };
        let job = run_job(Arc::clone(&cell), work, guard).boxed();

        // A rejected job is dropped, which unregisters and interrupts it.
        if self.workers.execute(job).is_err() {
            tracing::warn!(task = %id, "Submission rejected; pool is shut down");
            return Err(SubmitError::ShutDown);
        }

        if let Some(deadline) = cell.deadline() {
            self.deadlines.push(deadline, task);
        }
        Ok(TaskHandle::new(cell))
    }

    /// Stop accepting work and stop enforcing deadlines.
    ///
    /// Returns immediately. Work already dispatched keeps running to
    /// completion; use [`RetryablePool::shutdown_now`] to interrupt it.
    pub fn shutdown(&self) {
        tracing::info!(
            in_flight = self.in_flight.len(),
            "Shutting down retryable pool"
        );
        self.workers.shutdown();
        self.watcher.abort();
    }

    /// Shut down and interrupt every unfinished task; their handles resolve
    /// to [`TaskError::Interrupted`](retrypool_types::TaskError::Interrupted).
    pub fn shutdown_now(&self) {
        self.shutdown();
        self.workers.shutdown_now();

        let interrupted = self
            .in_flight
            .drain()
            .iter()
            .filter(|task| task.interrupt())
            .count();
        tracing::info!(interrupted, "Interrupted unfinished tasks");
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.workers.is_shutdown()
    }

    /// Tasks dispatched and not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Deadlines the watcher has not processed yet, including those of tasks
    /// that already finished.
    #[must_use]
    pub fn pending_deadlines(&self) -> usize {
        self.deadlines.len()
    }
}

/// Dispatched work outlives the pool, and so do its deadlines: the watcher
/// stays up until every queued deadline has been processed.
impl<P> Drop for RetryablePool<P> {
    fn drop(&mut self) {
        self.deadlines.close();
    }
}

impl<P: fmt::Debug> fmt::Debug for RetryablePool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryablePool")
            .field("workers", &self.workers)
            .field("policy", &self.policy)
            .field("backoff", &self.backoff)
            .field("watcher_stopped", &self.watcher.is_aborted())
            .finish_non_exhaustive()
    }
}
