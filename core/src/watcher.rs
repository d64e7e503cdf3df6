//! Deadline watcher.
//!
//! Submitters push bounded tasks into a [`DeadlineQueue`]; one background
//! task ([`watch_deadlines`]) sleeps until the earliest deadline, then cancels
//! every task whose deadline has passed and which has not finished yet.
//!
//! The queue is a mutex-guarded min-heap plus a [`Notify`]. Pushing always
//! notifies, so a watcher parked on a later deadline (or on an empty queue)
//! re-evaluates its sleep when an earlier deadline arrives.
//!
//! Closing the queue does not discard it: the watcher keeps enforcing the
//! deadlines already queued and returns once the heap is empty.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::handle::Expire;

/// A queued task, ordered by deadline and then by insertion order.
pub(crate) struct Expiring {
    deadline: Instant,
    seq: u64,
    task: Arc<dyn Expire>,
}

impl PartialEq for Expiring {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expiring {}

impl PartialOrd for Expiring {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiring {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
pub(crate) struct DeadlineQueue {
    heap: Mutex<BinaryHeap<Reverse<Expiring>>>,
    wakeup: Notify,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl DeadlineQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Expiring>>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, deadline: Instant, task: Arc<dyn Expire>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap().push(Reverse(Expiring {
            deadline,
            seq,
            task,
        }));
        self.wakeup.notify_one();
    }

    pub(crate) fn len(&self) -> usize {
        self.heap().len()
    }

    /// Let the watcher exit once the queued deadlines have been processed.
    pub(crate) fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.wakeup.notify_one();
    }

    fn is_drained(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire) && self.heap().is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.heap().peek().map(|Reverse(entry)| entry.deadline)
    }

    /// Remove every entry due at `now`, earliest first.
    fn pop_due(&self, now: Instant) -> Vec<Arc<dyn Expire>> {
        let mut heap = self.heap();
        let mut due = Vec::new();
        while heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.deadline <= now)
        {
            if let Some(Reverse(entry)) = heap.pop() {
                due.push(entry.task);
            }
        }
        due
    }
}

fn expire(task: &dyn Expire) {
    if task.is_done() {
        tracing::trace!(task = %task.id(), "Deadline reached after completion; discarding");
        return;
    }
    if task.cancel() {
        tracing::info!(task = %task.id(), "Found overrun task; cancelling");
    }
}

/// Watcher loop. Runs until the future is aborted, or the queue is closed
/// and drained.
pub(crate) async fn watch_deadlines(queue: Arc<DeadlineQueue>) {
    loop {
        // Register interest before looking at the heap, so a push or close
        // that lands between the peek and the await still wakes us.
        let mut notified = pin!(queue.wakeup.notified());
        notified.as_mut().enable();

        if queue.is_drained() {
            tracing::debug!("Deadline queue closed and drained; watcher exiting");
            return;
        }

        match queue.next_deadline() {
            None => notified.await,
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = notified => {}
                }
            }
        }

        for task in queue.pop_due(Instant::now()) {
            expire(task.as_ref());
        }
    }
}
