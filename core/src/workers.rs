//! Worker pool abstraction.
//!
//! The retryable pool only needs "run this unit of work somewhere"; it does
//! not care how wide the pool is or which runtime drives it. [`WorkerPool`]
//! is that seam, and [`TokioWorkerPool`] is the implementation used unless
//! the caller injects another one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::Semaphore;

/// A unit of work dispatched to a worker pool.
pub type Job = BoxFuture<'static, ()>;

/// The worker pool refused a job because it is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker pool is shut down")]
pub struct Rejected;

/// Executor the retryable pool dispatches task jobs to.
///
/// Implementations must drop a job they decide not to run rather than leak
/// it; the pool relies on that drop to resolve the task's handle.
pub trait WorkerPool: Send + Sync {
    /// Accept a job for execution. Must not block.
    fn execute(&self, job: Job) -> Result<(), Rejected>;

    /// Stop accepting new jobs. Jobs already accepted still run.
    fn shutdown(&self);

    /// Stop accepting new jobs and drop those not yet started.
    fn shutdown_now(&self) {
        self.shutdown();
    }

    fn is_shutdown(&self) -> bool;
}

impl<P: WorkerPool + ?Sized> WorkerPool for Arc<P> {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        (**self).execute(job)
    }

    fn shutdown(&self) {
        (**self).shutdown();
    }

    fn shutdown_now(&self) {
        (**self).shutdown_now();
    }

    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }
}

/// Bounded-width worker pool on a tokio runtime.
///
/// Every job is spawned as its own tokio task, but at most `width` of them run
/// at once; the rest wait for a permit in arrival order.
#[derive(Debug)]
pub struct TokioWorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
    width: usize,
    closed: AtomicBool,
}

impl TokioWorkerPool {
    /// Pool on the runtime the caller is running in.
    pub fn new(width: usize) -> Result<Self, TryCurrentError> {
        Ok(Self::with_handle(Handle::try_current()?, width))
    }

    /// Pool on an explicit runtime. A width of zero is raised to one.
    #[must_use]
    pub fn with_handle(runtime: Handle, width: usize) -> Self {
        let width = width.max(1);
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(width)),
            width,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Workers currently idle.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }
}

impl WorkerPool for TokioWorkerPool {
    fn execute(&self, job: Job) -> Result<(), Rejected> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Rejected);
        }

        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            // Closed semaphore: shut down before this job got a worker.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn shutdown_now(&self) {
        self.shutdown();
        self.permits.close();
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
