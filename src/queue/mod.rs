//! Work queues: dedup FIFO, delayed adds, and rate-limited retries.
//!
//! The layers stack the same way the controller uses them:
//!
//! ```text
//!   RateLimitingQueue  add_rate_limited / forget / num_requeues
//!         │
//!   DelayingQueue      add_after (single timer loop)
//!         │
//!   WorkQueue          add / get / done / shut_down (dirty + processing sets)
//! ```

pub mod delaying;
pub mod fifo;
pub mod rate_limiter;
pub mod rate_limiting;

use std::hash::Hash;

pub use delaying::DelayingQueue;
pub use fifo::WorkQueue;
pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, ItemFastSlowRateLimiter,
    MaxOfRateLimiter, RateLimiter, default_controller_rate_limiter,
};
pub use rate_limiting::RateLimitingQueue;

/// Anything that can sit in a queue: cheap to clone, hashable, shareable.
pub trait QueueItem: Clone + Eq + Hash + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + Send + Sync + 'static {}
