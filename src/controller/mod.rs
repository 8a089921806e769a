//! Controller: waits for the informer to sync, then runs a pool of workers
//! over the rate-limited queue until shutdown.
//!
//! ```text
//!   informer ──add──► RateLimitingQueue ──get──► worker ──► Handler::process_item
//!                          ▲                                   │
//!                          └──── add_rate_limited (n < 5) ◄────┤
//!                                forget + error sink (n = 5) ◄─┘
//! ```
//!
//! Two workers never see equal changes at the same time; that comes from the
//! queue's processing set, not from any lock held here.

mod dispatch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Indexer;
use crate::error::{Error, Result};
use crate::error_sink::{ErrorSink, GlobalErrorSink};
use crate::informer::{CACHE_SYNC_POLL_INTERVAL, Informer, wait_for_cache_sync};
use crate::model::Change;
use crate::queue::RateLimitingQueue;

use dispatch::Dispatcher;

/// Rate-limited requeues a change gets before it is dropped.
pub const MAX_REQUEUES: u32 = 5;

/// Pause before a worker whose dispatch loop returned is started again.
pub const WORKER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// How long `run` waits for the informer after shutdown before aborting it.
pub const INFORMER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Constructed, `run` not called yet or still waiting for sync.
    Idle,
    /// Informer synced, workers running.
    Running,
    /// Shutdown observed, waiting for in-flight changes.
    Stopping,
    /// All workers returned.
    Stopped,
}

/// Business logic applied to each change.
///
/// Called concurrently for distinct changes, never for equal ones. Must be
/// idempotent: the same change may be delivered again after a retry or after
/// being coalesced. An empty result is success.
#[async_trait]
pub trait Handler<V>: Send + Sync {
    async fn process_item(&self, ctx: &HandlerContext<V>, change: &Change)
    -> Vec<anyhow::Error>;
}

/// What a handler may see of its controller: the informer's cache.
pub struct HandlerContext<V> {
    indexer: Arc<Indexer<V>>,
}

impl<V> Clone for HandlerContext<V> {
    fn clone(&self) -> Self {
        Self {
            indexer: Arc::clone(&self.indexer),
        }
    }
}

impl<V> HandlerContext<V> {
    /// Current state of the resource behind `key`. `None` means deleted.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.indexer.get(key)
    }

    pub fn indexer(&self) -> &Indexer<V> {
        &self.indexer
    }
}

/// Shuts the queue down when dropped, whichever way `run` exits.
struct QueueShutdown<'a>(&'a RateLimitingQueue<Change>);

impl Drop for QueueShutdown<'_> {
    fn drop(&mut self) {
        self.0.shut_down();
    }
}

/// Change-processing controller.
pub struct Controller<V> {
    queue: Arc<RateLimitingQueue<Change>>,
    indexer: Arc<Indexer<V>>,
    informer: Arc<dyn Informer>,
    handler: Option<Arc<dyn Handler<V>>>,
    error_sink: Arc<dyn ErrorSink>,
    state: watch::Sender<ControllerState>,
}

impl<V: Send + Sync + 'static> Controller<V> {
    pub fn new(
        queue: Arc<RateLimitingQueue<Change>>,
        indexer: Arc<Indexer<V>>,
        informer: Arc<dyn Informer>,
    ) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            queue,
            indexer,
            informer,
            handler: None,
            error_sink: Arc::new(GlobalErrorSink),
            state,
        }
    }

    /// Install the business handler. Must happen before [`run`](Self::run).
    pub fn set_handler(&mut self, handler: Arc<dyn Handler<V>>) {
        self.handler = Some(handler);
    }

    /// Replace the default [`GlobalErrorSink`].
    pub fn set_error_sink(&mut self, sink: Arc<dyn ErrorSink>) {
        self.error_sink = sink;
    }

    pub fn queue(&self) -> &Arc<RateLimitingQueue<Change>> {
        &self.queue
    }

    pub fn indexer(&self) -> &Arc<Indexer<V>> {
        &self.indexer
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Run the informer and `workers` workers until `shutdown` is cancelled.
    ///
    /// Returns once every in-flight change has been handed back to the queue.
    /// An informer still running [`INFORMER_STOP_TIMEOUT`] after shutdown is
    /// aborted.
    /// If shutdown arrives before the informer has synced, a
    /// [`Error::CacheSyncTimeout`] is reported to the error sink and no worker
    /// is started.
    ///
    /// # Errors
    ///
    /// Fails before starting anything if no handler is installed or `workers`
    /// is zero. Handler errors are never returned here.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) -> Result<()> {
        let handler = self.handler.clone().ok_or(Error::HandlerNotSet)?;
        if workers == 0 {
            return Err(Error::Config("worker count must be positive".to_string()));
        }

        let queue_shutdown = QueueShutdown(&self.queue);
        info!(workers, "starting controller");

        let informer = Arc::clone(&self.informer);
        let informer_shutdown = shutdown.clone();
        let informer_task = tokio::spawn(async move { informer.run(informer_shutdown).await });

        let synced = wait_for_cache_sync(&shutdown, CACHE_SYNC_POLL_INTERVAL, || {
            self.informer.has_synced()
        })
        .await;
        if !synced {
            self.error_sink
                .report(&anyhow::Error::new(Error::CacheSyncTimeout));
            drop(queue_shutdown);
            join_informer(informer_task).await;
            self.state.send_replace(ControllerState::Stopped);
            return Ok(());
        }
        self.state.send_replace(ControllerState::Running);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.queue),
            HandlerContext {
                indexer: Arc::clone(&self.indexer),
            },
            handler,
            Arc::clone(&self.error_sink),
        );
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(dispatcher.clone().supervise(worker, shutdown.clone()));
        }

        shutdown.cancelled().await;
        self.state.send_replace(ControllerState::Stopping);
        info!("stopping controller");

        drop(queue_shutdown);
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker supervisor failed");
            }
        }
        join_informer(informer_task).await;

        self.state.send_replace(ControllerState::Stopped);
        debug!("controller stopped");
        Ok(())
    }
}

async fn join_informer(mut task: tokio::task::JoinHandle<()>) {
    let joined = match tokio::time::timeout(INFORMER_STOP_TIMEOUT, &mut task).await {
        Ok(joined) => joined,
        Err(_) => {
            warn!(timeout = ?INFORMER_STOP_TIMEOUT, "informer ignored shutdown, aborting it");
            task.abort();
            task.await
        }
    };
    match joined {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!(error = %e, "informer task failed"),
    }
}
