//! Delayed adds on top of [`WorkQueue`].
//!
//! Every `add_after` goes through a channel to one timer loop that keeps a
//! min-heap of pending adds keyed by ready time. An item waiting twice keeps
//! the earlier of its two ready times. The loop exits when the queue shuts
//! down or the queue handle is dropped.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{QueueItem, WorkQueue};

/// Stand-in ready time for delays past what `Instant` can represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Waiting<T> {
    item: T,
    ready_at: Instant,
}

/// Heap entry. Ordered by ready time only; `seq` breaks ties in insertion order.
struct Entry<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ready_at, self.seq).cmp(&(other.ready_at, other.seq))
    }
}

/// A [`WorkQueue`] that can also add items after a delay.
///
/// Must be created inside a Tokio runtime: construction spawns the timer loop.
pub struct DelayingQueue<T> {
    queue: Arc<WorkQueue<T>>,
    waiting_tx: mpsc::UnboundedSender<Waiting<T>>,
    stop: CancellationToken,
}

impl<T: QueueItem> DelayingQueue<T> {
    pub fn new() -> Self {
        let queue = Arc::new(WorkQueue::new());
        let (waiting_tx, waiting_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        tokio::spawn(waiting_loop(Arc::clone(&queue), waiting_rx, stop.clone()));
        Self {
            queue,
            waiting_tx,
            stop,
        }
    }

    /// The underlying dedup queue.
    pub fn queue(&self) -> &WorkQueue<T> {
        &self.queue
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    /// Add `item` once `delay` has elapsed. A zero delay adds immediately.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.queue.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.queue.add(item);
            return;
        }
        let now = Instant::now();
        let waiting = Waiting {
            item,
            ready_at: now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE),
        };
        // The loop only goes away on shutdown, when late adds are ignored anyway.
        let _ = self.waiting_tx.send(waiting);
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

    pub fn shut_down(&self) {
        self.stop.cancel();
        self.queue.shut_down();
    }

    pub async fn shut_down_with_drain(&self) {
        self.stop.cancel();
        self.queue.shut_down_with_drain().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }
}

impl<T: QueueItem> Default for DelayingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

async fn waiting_loop<T: QueueItem>(
    queue: Arc<WorkQueue<T>>,
    mut waiting_rx: mpsc::UnboundedReceiver<Waiting<T>>,
    stop: CancellationToken,
) {
    let mut heap: BinaryHeap<Reverse<Entry<T>>> = BinaryHeap::new();
    // Authoritative ready time per item; heap entries that disagree are stale.
    let mut known: HashMap<T, Instant> = HashMap::new();
    let mut seq: u64 = 0;

    loop {
        let now = Instant::now();
        while let Some(Reverse(top)) = heap.peek() {
            if top.ready_at > now {
                break;
            }
            let Some(Reverse(entry)) = heap.pop() else {
                break;
            };
            if known.get(&entry.item) == Some(&entry.ready_at) {
                known.remove(&entry.item);
                queue.add(entry.item);
            }
        }

        let next_ready = heap.peek().map(|Reverse(entry)| entry.ready_at);

        tokio::select! {
            () = stop.cancelled() => {
                trace!(pending = known.len(), "delaying queue timer loop stopped");
                return;
            }
            () = tokio::time::sleep_until(next_ready.unwrap_or(now)), if next_ready.is_some() => {}
            waiting = waiting_rx.recv() => {
                let Some(waiting) = waiting else {
                    return;
                };
                if waiting.ready_at <= Instant::now() {
                    queue.add(waiting.item);
                    continue;
                }
                let sooner_known = known
                    .get(&waiting.item)
                    .is_some_and(|existing| *existing <= waiting.ready_at);
                if !sooner_known {
                    known.insert(waiting.item.clone(), waiting.ready_at);
                    seq = seq.wrapping_add(1);
                    heap.push(Reverse(Entry {
                        ready_at: waiting.ready_at,
                        seq,
                        item: waiting.item,
                    }));
                }
            }
        }
    }
}
