//! Rate-limited retries on top of [`DelayingQueue`].

use std::time::Duration;

use super::{DelayingQueue, QueueItem, RateLimiter, default_controller_rate_limiter};

/// The queue the controller runs on: dedup, delayed adds, and per-item
/// backoff history.
pub struct RateLimitingQueue<T> {
    queue: DelayingQueue<T>,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T: QueueItem> RateLimitingQueue<T> {
    /// Must be called inside a Tokio runtime.
    pub fn new(limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            queue: DelayingQueue::new(),
            limiter,
        }
    }

    /// Queue with [`default_controller_rate_limiter`].
    pub fn with_default_limiter() -> Self {
        Self::new(Box::new(default_controller_rate_limiter()))
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    /// Add `item` once the limiter says it may be retried.
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.limiter.when(&item);
        self.queue.add_after(item, delay);
    }

    /// Clear the backoff history of `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.limiter.num_requeues(item)
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of items currently leased to workers.
    pub fn processing(&self) -> usize {
        self.queue.queue().processing()
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub async fn shut_down_with_drain(&self) {
        self.queue.shut_down_with_drain().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}
