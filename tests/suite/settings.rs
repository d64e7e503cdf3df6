//! Validation of retry and timeout settings, and snapshot isolation.

use std::sync::Arc;
use std::time::Duration;

use retrypool_config::RetrypoolConfig;
use retrypool_core::{
    PolicyError, PoolError, RetryBudget, RetryablePool, TaskError, TaskTimeout, TokioWorkerPool,
};
use tokio::sync::Semaphore;

use crate::common::{Calls, Flag, SLOW_RESULT, failing, pool, slow};

#[tokio::test]
async fn zero_timeout_is_rejected_and_previous_value_kept() {
    let pool = pool(0, 5_000);
    assert_eq!(pool.set_timeout(0), Err(PolicyError::ZeroTimeout));
    assert_eq!(pool.timeout().as_millis(), 5_000);
}

#[tokio::test]
async fn negative_retries_are_rejected_and_previous_value_kept() {
    let pool = pool(3, -1);
    assert_eq!(pool.set_retries(-1), Err(PolicyError::NegativeRetries(-1)));
    assert_eq!(pool.retries(), RetryBudget::new(3));
}

#[tokio::test]
async fn any_negative_timeout_means_unbounded() {
    let pool = pool(0, 100);
    for millis in [-1, -5, i64::MIN] {
        pool.set_timeout(millis).unwrap();
        assert_eq!(pool.timeout(), TaskTimeout::Unbounded);
        assert_eq!(pool.timeout().as_millis(), TaskTimeout::UNBOUNDED_MILLIS);
    }
}

#[tokio::test]
async fn constructor_validates_like_the_setters() {
    let workers = TokioWorkerPool::new(1).unwrap();
    assert!(matches!(
        RetryablePool::new(workers, -2, 1_000),
        Err(PoolError::Policy(PolicyError::NegativeRetries(-2)))
    ));

    let workers = TokioWorkerPool::new(1).unwrap();
    assert!(matches!(
        RetryablePool::new(workers, 1, 0),
        Err(PoolError::Policy(PolicyError::ZeroTimeout))
    ));
}

#[tokio::test]
async fn retry_change_does_not_reach_submitted_tasks() {
    let pool = pool(0, -1);
    let gate = Arc::new(Semaphore::new(0));
    let calls = Calls::default();

    let op_gate = Arc::clone(&gate);
    let op_calls = calls.clone();
    let held = pool
        .submit(move || {
            let gate = Arc::clone(&op_gate);
            op_calls.bump();
            async move {
                let _permit = gate.acquire().await;
                Err::<(), _>("still failing".to_string())
            }
        })
        .unwrap();

    pool.set_retries(3).unwrap();
    gate.add_permits(16);
    assert!(matches!(held.await, Err(TaskError::Failed(_))));
    assert_eq!(calls.get(), 1);

    let later_calls = Calls::default();
    let later = pool.submit(failing(later_calls.clone())).unwrap();
    assert!(later.await.unwrap_err().is_failed());
    assert_eq!(later_calls.get(), 4);
}

#[tokio::test(start_paused = true)]
async fn timeout_change_does_not_reach_submitted_tasks() {
    let pool = pool(0, 1_000);
    let bounded = pool
        .submit(slow(Duration::from_secs(5), Flag::default()))
        .unwrap();

    pool.set_timeout(-1).unwrap();
    let unbounded = pool
        .submit(slow(Duration::from_secs(5), Flag::default()))
        .unwrap();

    assert!(bounded.await.unwrap_err().is_cancelled());
    assert_eq!(unbounded.await.unwrap(), SLOW_RESULT);
}

#[tokio::test(start_paused = true)]
async fn pool_built_from_config() {
    let toml_str = r#"
[pool]
workers = 2
retries = 1
timeout_ms = 2000
"#;
    let settings = RetrypoolConfig::from_toml_str(toml_str)
        .unwrap()
        .settings()
        .unwrap();
    let workers = TokioWorkerPool::new(settings.workers.get()).unwrap();
    let pool = RetryablePool::with_settings(workers, settings.policy, settings.backoff).unwrap();

    assert_eq!(pool.workers().width(), 2);
    assert_eq!(pool.retries(), RetryBudget::new(1));

    let calls = Calls::default();
    let handle = pool.submit(failing(calls.clone())).unwrap();
    assert!(handle.await.unwrap_err().is_failed());
    assert_eq!(calls.get(), 2);

    let handle = pool
        .submit(slow(Duration::from_secs(3), Flag::default()))
        .unwrap();
    assert!(handle.await.unwrap_err().is_cancelled());
}
