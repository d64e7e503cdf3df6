//! Deadline enforcement, mostly on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use retrypool_core::{RetryablePool, TaskError, TaskPhase, TokioWorkerPool};
use tokio::time::Instant;

use crate::common::{Calls, Flag, SLOW_RESULT, failing, pool, slow};

#[tokio::test(start_paused = true)]
async fn operation_outliving_its_timeout_is_cancelled() {
    let pool = pool(0, 5_000);
    let finished = Flag::default();
    let started = Instant::now();

    let handle = pool
        .submit(slow(Duration::from_millis(10_000), finished.clone()))
        .unwrap();
    let result = handle.await;
    let resolved_after = started.elapsed();

    assert!(matches!(result, Err(TaskError::Cancelled)));
    assert!(resolved_after >= Duration::from_millis(5_000), "{resolved_after:?}");
    assert!(resolved_after < Duration::from_millis(10_000), "{resolved_after:?}");

    // The operation was dropped, not left running in the background.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!finished.is_set());
}

#[tokio::test(start_paused = true)]
async fn operation_within_its_timeout_returns_its_result() {
    let pool = pool(0, 15_000);
    let finished = Flag::default();

    let mut handle = pool
        .submit(slow(Duration::from_millis(10_000), finished.clone()))
        .unwrap();
    assert_eq!((&mut handle).await.unwrap(), SLOW_RESULT);
    assert!(finished.is_set());
    assert!(handle.is_done());
    assert!(!handle.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn late_deadline_does_not_touch_a_completed_task() {
    let pool = pool(0, 1_000);
    let mut handle = pool
        .submit(slow(Duration::from_millis(200), Flag::default()))
        .unwrap();
    assert_eq!((&mut handle).await.unwrap(), SLOW_RESULT);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(handle.phase(), TaskPhase::Completed);
    assert_eq!(pool.pending_deadlines(), 0);
}

#[tokio::test(start_paused = true)]
async fn duration_against_timeout() {
    for (duration_ms, timeout_ms) in [(10, 20), (19, 20), (21, 20), (500, 20), (1, 5_000)] {
        let pool = pool(0, timeout_ms);
        let handle = pool
            .submit(slow(Duration::from_millis(duration_ms), Flag::default()))
            .unwrap();
        let result = handle.await;
        if duration_ms < timeout_ms.unsigned_abs() {
            assert_eq!(result.unwrap(), SLOW_RESULT, "d={duration_ms} t={timeout_ms}");
        } else {
            assert!(
                matches!(result, Err(TaskError::Cancelled)),
                "d={duration_ms} t={timeout_ms}"
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn nearest_deadline_fires_first() {
    let pool = pool(0, 3_000);
    let third = pool.submit(slow(Duration::from_secs(60), Flag::default())).unwrap();
    pool.set_timeout(1_000).unwrap();
    let first = pool.submit(slow(Duration::from_secs(60), Flag::default())).unwrap();
    pool.set_timeout(2_000).unwrap();
    let second = pool.submit(slow(Duration::from_secs(60), Flag::default())).unwrap();
    assert_eq!(pool.pending_deadlines(), 3);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert!(!third.is_cancelled());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(second.is_cancelled());
    assert!(!third.is_cancelled());

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(third.is_cancelled());
    assert_eq!(pool.pending_deadlines(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_covers_all_attempts() {
    let pool = pool(1_000, 50);
    let calls = Calls::default();
    let op_calls = calls.clone();
    let handle = pool
        .submit(move || {
            let mut attempt = failing(op_calls.clone());
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                attempt().await
            }
        })
        .unwrap();

    assert!(handle.await.unwrap_err().is_cancelled());
    // Attempts end at 20ms and 40ms; the third is cut off at 50ms.
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn unbounded_tasks_never_expire() {
    let pool = pool(0, -1);
    let handle = pool
        .submit(slow(Duration::from_secs(3_600), Flag::default()))
        .unwrap();
    assert_eq!(handle.remaining_delay(), None);
    assert_eq!(handle.await.unwrap(), SLOW_RESULT);
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation() {
    let pool = pool(0, -1);
    let finished = Flag::default();
    let handle = pool
        .submit(slow(Duration::from_secs(10), finished.clone()))
        .unwrap();
    tokio::task::yield_now().await;

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(handle.is_cancelled());
    assert!(!handle.is_done());
    assert!(matches!(handle.await, Err(TaskError::Cancelled)));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(!finished.is_set());
}

#[tokio::test(start_paused = true)]
async fn join_timeout_is_the_callers_own_limit() {
    let pool = pool(0, -1);
    let mut handle = pool
        .submit(slow(Duration::from_secs(10), Flag::default()))
        .unwrap();

    let err = handle.join_timeout(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_timed_out());
    assert!(!handle.is_finished());

    assert_eq!(handle.join().await.unwrap(), SLOW_RESULT);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_submitters_share_one_watcher() {
    const SUBMITTERS: usize = 16;
    const TASKS_EACH: usize = 16;

    // Wide enough that no task waits for a worker.
    let workers = TokioWorkerPool::new(SUBMITTERS * TASKS_EACH).unwrap();
    let pool = Arc::new(RetryablePool::new(workers, 0, 200).unwrap());

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|submitter| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let handles: Vec<_> = (0..TASKS_EACH)
                    .map(|task| {
                        let overruns = (submitter + task) % 2 == 0;
                        let duration = if overruns {
                            Duration::from_secs(10)
                        } else {
                            Duration::from_millis(5)
                        };
                        let handle = pool.submit(slow(duration, Flag::default())).unwrap();
                        (overruns, handle)
                    })
                    .collect();

                let mut mismatches = 0;
                for (overruns, handle) in handles {
                    let as_expected = match handle.await {
                        Ok(result) => !overruns && result == SLOW_RESULT,
                        Err(TaskError::Cancelled) => overruns,
                        Err(_) => false,
                    };
                    if !as_expected {
                        mismatches += 1;
                    }
                }
                mismatches
            })
        })
        .collect();

    let mut mismatches = 0;
    for submitter in submitters {
        mismatches += submitter.await.unwrap();
    }
    assert_eq!(mismatches, 0);

    // Deadlines of the fast tasks are discarded as they come due; cancelled
    // jobs unregister once their worker notices the abort.
    let give_up = Instant::now() + Duration::from_secs(5);
    while (pool.pending_deadlines() > 0 || pool.in_flight() > 0) && Instant::now() < give_up {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.pending_deadlines(), 0);
    assert_eq!(pool.in_flight(), 0);
}
