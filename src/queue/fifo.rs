//! Deduplicating FIFO with processing leases.
//!
//! An item is *dirty* from `add` until a worker picks it up with `get`, and
//! *processing* from `get` until `done`. Adding a dirty item is a no-op.
//! Adding a processing item only marks it dirty; `done` puts it back on the
//! queue once, no matter how many adds arrived in the meantime.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::QueueItem;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Thread-safe dedup work queue.
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    drained: Notify,
}

impl<T: QueueItem> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueItem> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            ready: Notify::new(),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing.
    pub fn add(&self, item: T) {
        {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.ready.notify_one();
    }

    /// Wait for the next item and lease it to the caller.
    ///
    /// Returns `None` once the queue is shut down, even if items are still
    /// waiting. Every `Some(item)` must be paired with exactly one [`done`].
    ///
    /// [`done`]: WorkQueue::done
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Release the lease on `item`, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            let requeued = !state.shutting_down && state.dirty.contains(item);
            if requeued {
                state.queue.push_back(item.clone());
            }
            if state.processing.is_empty() {
                self.drained.notify_waiters();
            }
            requeued
        };
        if requeued {
            self.ready.notify_one();
        }
    }

    /// Number of items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items currently leased to workers.
    pub fn processing(&self) -> usize {
        self.lock().processing.len()
    }

    /// Make every current and future `get` return `None`. Idempotent.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.ready.notify_waiters();
    }

    /// Shut down and wait until every outstanding lease has been released.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
