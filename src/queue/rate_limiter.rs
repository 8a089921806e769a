//! # Rate limiters for re-enqueued items.
//!
//! A [`RateLimiter`] answers "how long should this item wait before it is
//! retried?" and keeps the per-item history needed to answer it:
//! - [`ItemExponentialFailureRateLimiter`] doubles the delay per failure, capped;
//! - [`ItemFastSlowRateLimiter`] retries quickly a few times, then slowly;
//! - [`BucketRateLimiter`] is an overall token bucket shared by all items;
//! - [`MaxOfRateLimiter`] combines several limiters and takes the worst case.
//!
//! The controller default is [`default_controller_rate_limiter`]: per-item
//! exponential backoff from 5ms to 1000s, bounded by an overall 10 qps bucket
//! with a burst of 100.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::QueueItem;

/// Per-item retry delay policy.
pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` may be added again. Records one more requeue.
    fn when(&self, item: &T) -> Duration;

    /// Drop all history for `item`.
    fn forget(&self, item: &T);

    /// How many times `item` has been requeued since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Exponential
// ---------------------------------------------------------------------------

/// `base × 2^failures`, clamped to `max`.
pub struct ItemExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: QueueItem> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: QueueItem> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = {
            let mut failures = lock(&self.failures);
            let count = failures.entry(item.clone()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        1u32.checked_shl(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |backoff| backoff.min(self.max))
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Fast / slow
// ---------------------------------------------------------------------------

/// `fast` for the first `max_fast_attempts` requeues of an item, `slow` after.
pub struct ItemFastSlowRateLimiter<T> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    failures: Mutex<HashMap<T, u32>>,
}

impl<T: QueueItem> ItemFastSlowRateLimiter<T> {
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: QueueItem> RateLimiter<T> for ItemFastSlowRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        *count = count.saturating_add(1);
        if *count <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &T) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Token bucket
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket: `qps` tokens per second, holding at most `burst`.
///
/// Each `when` takes a token; when the bucket is empty the returned delay is
/// the time until the token being borrowed is refilled. Keeps no per-item
/// history, so `num_requeues` is always 0.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            // A tiny qps makes the wait too large for a Duration.
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

// ---------------------------------------------------------------------------
// Max of
// ---------------------------------------------------------------------------

/// Worst case across several limiters: longest delay, highest requeue count.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        // Every limiter must see the call so its history advances.
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Exponential per-item backoff (5ms to 1000s) bounded by a 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<T: QueueItem>() -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_millis(6));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(2));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(4));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(6));
        assert_eq!(limiter.when(&"a"), Duration::from_millis(6));
        assert_eq!(limiter.num_requeues(&"a"), 5);

        // Other items have their own history.
        assert_eq!(limiter.when(&"b"), Duration::from_millis(1));
    }

    #[test]
    fn exponential_forget_resets_history() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        limiter.when(&"a");
        limiter.when(&"a");
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(1));
    }

    #[test]
    fn exponential_survives_huge_exponents() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..2000 {
            limiter.when(&"a");
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1000));
    }

    #[test]
    fn fast_slow_switches_after_fast_attempts() {
        let limiter =
            ItemFastSlowRateLimiter::new(Duration::from_millis(5), Duration::from_secs(10), 3);
        for _ in 0..3 {
            assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
        }
        assert_eq!(limiter.when(&"a"), Duration::from_secs(10));
        assert_eq!(limiter.num_requeues(&"a"), 4);
        limiter.forget(&"a");
        assert_eq!(limiter.when(&"a"), Duration::from_millis(5));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let limiter = BucketRateLimiter::new(1.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::ZERO);
        let delay = RateLimiter::<&str>::when(&limiter, &"c");
        assert!(delay > Duration::from_millis(900), "delay was {delay:?}");
        assert!(delay <= Duration::from_secs(1));
        assert_eq!(RateLimiter::<&str>::num_requeues(&limiter, &"c"), 0);
    }

    #[test]
    fn bucket_with_negligible_rate_saturates_instead_of_panicking() {
        let limiter = BucketRateLimiter::new(1e-20, 1);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::MAX);
    }

    #[test]
    fn max_of_takes_worst_case() {
        let limiter: MaxOfRateLimiter<&str> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_secs(1),
            )),
            Box::new(ItemFastSlowRateLimiter::new(
                Duration::from_millis(3),
                Duration::from_secs(1),
                1,
            )),
        ]);
        assert_eq!(limiter.when(&"a"), Duration::from_millis(3));
        assert_eq!(limiter.when(&"a"), Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&"a"), 2);
        limiter.forget(&"a");
        assert_eq!(limiter.num_requeues(&"a"), 0);
    }

    #[test]
    fn default_limiter_counts_requeues_per_item() {
        let limiter = default_controller_rate_limiter::<String>();
        let item = "a".to_string();
        assert_eq!(limiter.when(&item), Duration::from_millis(5));
        assert_eq!(limiter.when(&item), Duration::from_millis(10));
        assert_eq!(limiter.num_requeues(&item), 2);
    }
}
