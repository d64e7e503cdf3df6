//! Bounded-retry, bounded-timeout task pool.
//!
//! [`RetryablePool`] wraps a [`WorkerPool`]. Each submitted operation is
//! retried up to the pool's retry count, and the whole attempt sequence is
//! cancelled if it outlives the pool's timeout. Callers get a [`TaskHandle`]
//! back immediately.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use retrypool_core::{RetryablePool, TokioWorkerPool};
//!
//! let pool = RetryablePool::new(TokioWorkerPool::new(4)?, 3, 5_000)?;
//! let handle = pool.submit(|| async { Ok::<_, String>("fetched") })?;
//! assert_eq!(handle.await?, "fetched");
//! # Ok(())
//! # }
//! ```

mod handle;
mod pool;
mod retry;
mod watcher;
mod workers;

pub use handle::{CancelSignal, TaskHandle, TaskPhase};
pub use pool::{PoolError, RetryablePool, SubmitError};
pub use retry::RetryWrapper;
pub use workers::{Job, Rejected, TokioWorkerPool, WorkerPool};

pub use retrypool_types::{
    Backoff, ExecutionPolicy, PolicyError, RetryBudget, TaskError, TaskId, TaskTimeout,
};
