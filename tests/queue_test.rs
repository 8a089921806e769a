//! Integration tests for the work queue stack.

use std::sync::Arc;
use std::time::Duration;

use watcher_base::queue::{
    BucketRateLimiter, DelayingQueue, ItemExponentialFailureRateLimiter, RateLimitingQueue,
    WorkQueue,
};

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_adds_collapse_while_waiting() {
    let queue = WorkQueue::new();
    queue.add("a");
    queue.add("b");
    queue.add("a");

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.get().await, Some("a"));
    assert_eq!(queue.get().await, Some("b"));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn add_during_processing_requeues_once_on_done() {
    let queue = WorkQueue::new();
    queue.add("a");
    let item = queue.get().await.unwrap();
    assert_eq!(queue.processing(), 1);

    queue.add("a");
    queue.add("a");
    // Not handed out while leased.
    assert_eq!(queue.len(), 0);

    queue.done(&item);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some("a"));
    queue.done(&"a");
    assert!(queue.is_empty());
    assert_eq!(queue.processing(), 0);
}

#[tokio::test]
async fn done_without_new_add_does_not_requeue() {
    let queue = WorkQueue::new();
    queue.add(1);
    let item = queue.get().await.unwrap();
    queue.done(&item);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn shut_down_wakes_blocked_getters() {
    let queue = Arc::new(WorkQueue::<u32>::new());
    let getters: Vec<_> = (0..3)
        .map(|_| {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.shut_down();

    for getter in getters {
        let result = tokio::time::timeout(Duration::from_secs(1), getter)
            .await
            .expect("get should return after shutdown")
            .unwrap();
        assert_eq!(result, None);
    }
}

#[tokio::test]
async fn get_after_shut_down_returns_none_even_with_items() {
    let queue = WorkQueue::new();
    queue.add("a");
    queue.shut_down();
    queue.shut_down();

    assert!(queue.is_shutting_down());
    assert_eq!(queue.get().await, None);
}

#[tokio::test]
async fn add_after_shut_down_is_ignored() {
    let queue = WorkQueue::new();
    queue.shut_down();
    queue.add("a");
    assert!(queue.is_empty());
}

#[tokio::test]
async fn waiting_getter_receives_later_add() {
    let queue = Arc::new(WorkQueue::new());
    let getter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.get().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.add("late");

    let got = tokio::time::timeout(Duration::from_secs(1), getter)
        .await
        .expect("getter should wake")
        .unwrap();
    assert_eq!(got, Some("late"));
}

#[tokio::test]
async fn drain_waits_for_outstanding_leases() {
    let queue = Arc::new(WorkQueue::new());
    queue.add("a");
    let item = queue.get().await.unwrap();

    let drain = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.shut_down_with_drain().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!drain.is_finished());
    assert!(queue.is_shutting_down());

    queue.done(&item);
    tokio::time::timeout(Duration::from_secs(1), drain)
        .await
        .expect("drain should finish once the lease is released")
        .unwrap();
}

#[tokio::test]
async fn drain_with_nothing_leased_returns_immediately() {
    let queue = WorkQueue::<u8>::new();
    tokio::time::timeout(Duration::from_millis(100), queue.shut_down_with_drain())
        .await
        .expect("nothing to drain");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equal_items_are_never_leased_twice_at_once() {
    let queue = Arc::new(WorkQueue::new());
    queue.add("same");
    let first = queue.get().await.unwrap();
    queue.add("same");

    let second = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.get().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());

    queue.done(&first);
    let got = tokio::time::timeout(Duration::from_secs(1), second)
        .await
        .expect("second lease after done")
        .unwrap();
    assert_eq!(got, Some("same"));
}

// ---------------------------------------------------------------------------
// DelayingQueue
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn add_after_becomes_visible_once_delay_elapses() {
    let queue = DelayingQueue::new();
    queue.add_after("a", Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert!(queue.is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some("a"));
}

#[tokio::test(start_paused = true)]
async fn add_after_keeps_the_earlier_ready_time() {
    let queue = DelayingQueue::new();
    queue.add_after("a", Duration::from_secs(10));
    queue.add_after("a", Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some("a"));
    queue.done(&"a");

    // The later timer does not produce a second add.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn delayed_items_arrive_in_ready_order() {
    let queue = DelayingQueue::new();
    queue.add_after("slow", Duration::from_millis(300));
    queue.add_after("fast", Duration::from_millis(100));
    queue.add_after("mid", Duration::from_millis(200));

    tokio::time::sleep(Duration::from_millis(301)).await;
    assert_eq!(queue.get().await, Some("fast"));
    assert_eq!(queue.get().await, Some("mid"));
    assert_eq!(queue.get().await, Some("slow"));
}

#[tokio::test]
async fn zero_delay_adds_immediately() {
    let queue = DelayingQueue::new();
    queue.add_after("now", Duration::ZERO);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn unrepresentable_delay_parks_the_item() {
    let queue = DelayingQueue::new();
    queue.add_after("never", Duration::MAX);
    queue.add("now");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some("now"));
}

#[tokio::test(start_paused = true)]
async fn pending_delays_are_dropped_on_shut_down() {
    let queue = DelayingQueue::new();
    queue.add_after("a", Duration::from_millis(100));
    queue.shut_down();
    queue.add_after("b", Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(queue.is_empty());
    assert_eq!(queue.get().await, None);
}

// ---------------------------------------------------------------------------
// RateLimitingQueue
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rate_limited_adds_back_off_and_count_requeues() {
    let queue = RateLimitingQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
        Duration::from_millis(100),
        Duration::from_secs(10),
    )));

    queue.add_rate_limited("a");
    assert_eq!(queue.num_requeues(&"a"), 1);
    tokio::time::sleep(Duration::from_millis(101)).await;
    assert_eq!(queue.get().await, Some("a"));
    queue.done(&"a");

    queue.add_rate_limited("a");
    assert_eq!(queue.num_requeues(&"a"), 2);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_millis(51)).await;
    assert_eq!(queue.len(), 1);

    queue.forget(&"a");
    assert_eq!(queue.num_requeues(&"a"), 0);
}

#[tokio::test]
async fn default_limiter_counts_per_item() {
    let queue = RateLimitingQueue::with_default_limiter();
    queue.add_rate_limited("a");
    queue.add_rate_limited("a");
    queue.add_rate_limited("b");

    assert_eq!(queue.num_requeues(&"a"), 2);
    assert_eq!(queue.num_requeues(&"b"), 1);
    assert_eq!(queue.num_requeues(&"c"), 0);
}

#[tokio::test]
async fn starved_bucket_does_not_panic_the_caller() {
    let queue = RateLimitingQueue::new(Box::new(BucketRateLimiter::new(1e-20, 1)));
    queue.add_rate_limited("a");
    queue.add_rate_limited("b");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await, Some("a"));
}
