//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use watcher_base::cache::Indexer;
use watcher_base::controller::{Controller, Handler, HandlerContext};
use watcher_base::error_sink::ErrorSink;
use watcher_base::informer::Informer;
use watcher_base::model::Change;
use watcher_base::queue::RateLimitingQueue;

// ---------------------------------------------------------------------------
// Informer that replays a fixed set of changes
// ---------------------------------------------------------------------------

pub struct FakeInformer {
    queue: Arc<RateLimitingQueue<Change>>,
    seed: Vec<Change>,
    will_sync: bool,
    synced: AtomicBool,
}

impl FakeInformer {
    pub fn new(queue: Arc<RateLimitingQueue<Change>>, seed: Vec<Change>) -> Self {
        Self {
            queue,
            seed,
            will_sync: true,
            synced: AtomicBool::new(false),
        }
    }

    pub fn never_syncing(queue: Arc<RateLimitingQueue<Change>>) -> Self {
        Self {
            will_sync: false,
            ..Self::new(queue, Vec::new())
        }
    }
}

#[async_trait]
impl Informer for FakeInformer {
    async fn run(&self, shutdown: CancellationToken) {
        for change in &self.seed {
            self.queue.add(change.clone());
        }
        if self.will_sync {
            self.synced.store(true, Ordering::SeqCst);
        }
        shutdown.cancelled().await;
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Error sink that remembers what it was told
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, err: &anyhow::Error) {
        self.reports.lock().unwrap().push(err.to_string());
    }
}

// ---------------------------------------------------------------------------
// Handler that records, sleeps, and fails on request
// ---------------------------------------------------------------------------

pub struct TestHandler {
    invocations: Mutex<Vec<Change>>,
    fail_first: usize,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    finished: AtomicUsize,
}

impl TestHandler {
    pub fn succeeding() -> Self {
        Self::failing_first(0)
    }

    /// Fails invocations 1..=n, succeeds afterwards.
    pub fn failing_first(n: usize) -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
            fail_first: n,
            delay: Duration::ZERO,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<Change> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler<String> for TestHandler {
    async fn process_item(
        &self,
        _ctx: &HandlerContext<String>,
        change: &Change,
    ) -> Vec<anyhow::Error> {
        let attempt = {
            let mut invocations = self.invocations.lock().unwrap();
            invocations.push(change.clone());
            invocations.len()
        };
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);

        if attempt <= self.fail_first {
            vec![anyhow::anyhow!("attempt {attempt} failed")]
        } else {
            Vec::new()
        }
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: Arc<Controller<String>>,
    pub sink: Arc<RecordingSink>,
    pub shutdown: CancellationToken,
}

impl Harness {
    /// Controller over a [`FakeInformer`] seeded with `seed`.
    pub fn new(seed: Vec<Change>, handler: Arc<dyn Handler<String>>) -> Self {
        let queue = Arc::new(RateLimitingQueue::with_default_limiter());
        let informer = Arc::new(FakeInformer::new(Arc::clone(&queue), seed));
        Self::with_informer(queue, informer, handler)
    }

    pub fn with_informer(
        queue: Arc<RateLimitingQueue<Change>>,
        informer: Arc<dyn Informer>,
        handler: Arc<dyn Handler<String>>,
    ) -> Self {
        let indexer = Arc::new(Indexer::new(|s: &String| Ok(s.clone())));
        let sink = Arc::new(RecordingSink::default());

        let mut controller = Controller::new(queue, indexer, informer);
        controller.set_handler(handler);
        controller.set_error_sink(sink.clone());

        Self {
            controller: Arc::new(controller),
            sink,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start `run` in the background.
    pub fn spawn(&self, workers: usize) -> tokio::task::JoinHandle<watcher_base::error::Result<()>> {
        let controller = Arc::clone(&self.controller);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { controller.run(workers, shutdown).await })
    }

    pub fn num_requeues(&self, change: &Change) -> u32 {
        self.controller.queue().num_requeues(change)
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
