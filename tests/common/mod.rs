//! Shared test utilities and fixtures
//!
//! Operations with scripted behaviour, plus pool constructors.

#![allow(dead_code)]

use std::future::{self, Ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use retrypool_core::{RetryablePool, TokioWorkerPool};

pub const SLOW_RESULT: &str = "slow result";

/// Pool of width 4 on the test's runtime.
pub fn pool(retries: i64, timeout_ms: i64) -> RetryablePool {
    let workers = TokioWorkerPool::new(4).expect("tests run inside a tokio runtime");
    RetryablePool::new(workers, retries, timeout_ms).expect("valid pool settings")
}

/// Call counter shared between a test and the operation it submits.
#[derive(Debug, Clone, Default)]
pub struct Calls(Arc<AtomicU32>);

impl Calls {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Record a call and return its 1-based number.
    pub fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Set once by an operation that ran to its end.
#[derive(Debug, Clone, Default)]
pub struct Flag(Arc<AtomicBool>);

impl Flag {
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Async operation that fails `failures` times, then succeeds with the
/// number of the call that succeeded.
pub fn flaky(
    failures: u32,
    calls: Calls,
) -> impl FnMut() -> Ready<Result<u32, String>> + Send + 'static {
    move || {
        let call = calls.bump();
        future::ready(if call <= failures {
            Err(format!("failure #{call}"))
        } else {
            Ok(call)
        })
    }
}

/// Async operation that always fails.
pub fn failing(calls: Calls) -> impl FnMut() -> Ready<Result<u32, String>> + Send + 'static {
    flaky(u32::MAX, calls)
}

/// Async operation that takes `duration`, sets `finished`, then returns
/// [`SLOW_RESULT`].
pub fn slow(
    duration: Duration,
    finished: Flag,
) -> impl FnMut() -> BoxFuture<'static, Result<&'static str, String>> + Send + 'static {
    move || {
        let finished = finished.clone();
        async move {
            tokio::time::sleep(duration).await;
            finished.set();
            Ok(SLOW_RESULT)
        }
        .boxed()
    }
}
