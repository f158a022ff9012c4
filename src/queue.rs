//! Deduplicating keyed work queue
//!
//! Feeds the worker pool. For any key the queue guarantees at most one
//! worker is processing it at a time; re-adds while a key is active are
//! coalesced into a single re-enqueue when the worker finishes. Per-key
//! failure counts drive exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::store::ObjectKey;

/// First retry delay after a handler failure
const BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound on the retry delay
const BACKOFF_CAP: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    active: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shut_down: bool,
}

/// Work queue keyed by `(namespace, name)`.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a key. Duplicates of an already-pending key are dropped;
    /// a key currently being processed is marked dirty and re-enqueued
    /// when its worker calls [`WorkQueue::done`].
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return;
        }

        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }

        if state.queued.insert(key.clone()) {
            state.pending.push_back(key);
            self.notify.notify_one();
        }
    }

    /// Pop the next key, waiting until one is available. Returns `None`
    /// once the queue has been shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().unwrap();
                if state.shut_down {
                    drop(state);
                    // chain the wakeup so every parked worker observes shutdown
                    self.notify.notify_one();
                    return None;
                }

                if let Some(key) = state.pending.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    if !state.pending.is_empty() {
                        // chain the wakeup so idle workers keep draining
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark processing of a key as finished; re-enqueues the key if it was
    /// re-added while active.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(key);

        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.pending.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Record a failure for a key and return the delay before its retry.
    pub fn failure_backoff(&self, key: &ObjectKey) -> Duration {
        let mut state = self.state.lock().unwrap();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures += 1;

        let exponent = (*failures - 1).min(28);
        let millis = (BACKOFF_BASE.as_millis() as u64) << exponent;
        Duration::from_millis(millis).min(BACKOFF_CAP)
    }

    /// Drop the failure history for a key after a successful round.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().unwrap().failures.remove(key);
    }

    /// Stop accepting work and wake all waiting workers.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shut_down = true;
        self.notify.notify_waiters();
        // stored permit covers a worker between its empty-queue check and
        // its park
        self.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}
