//! Informer over a list-then-watch transport.
//!
//! Each cycle lists every object, reconciles the cache against the listing,
//! marks the informer synced, then applies watch events until the watch ends.
//! The next cycle starts `relist_delay` later. A failed cycle is also reported
//! to the error sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Informer;
use crate::cache::Indexer;
use crate::error_sink::{ErrorSink, GlobalErrorSink};
use crate::model::Change;
use crate::queue::RateLimitingQueue;

/// A single observed transition, carrying the object's latest state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent<V> {
    Added(V),
    Modified(V),
    Deleted(V),
}

/// The transport an informer reads from.
#[async_trait]
pub trait ListWatch<V>: Send + Sync {
    /// Every object that currently exists.
    async fn list(&self) -> anyhow::Result<Vec<V>>;

    /// Events from now on. The channel closing ends the watch.
    async fn watch(
        &self,
        shutdown: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<WatchEvent<V>>>;
}

/// Keeps an [`Indexer`] in sync with a [`ListWatch`] and enqueues a [`Change`]
/// for every create, update and delete it observes.
pub struct ListWatchInformer<V> {
    source: Arc<dyn ListWatch<V>>,
    indexer: Arc<Indexer<V>>,
    queue: Arc<RateLimitingQueue<Change>>,
    error_sink: Arc<dyn ErrorSink>,
    relist_delay: Duration,
    synced: AtomicBool,
}

impl<V: Send + Sync + 'static> ListWatchInformer<V> {
    pub fn new(
        source: Arc<dyn ListWatch<V>>,
        indexer: Arc<Indexer<V>>,
        queue: Arc<RateLimitingQueue<Change>>,
    ) -> Self {
        Self {
            source,
            indexer,
            queue,
            error_sink: Arc::new(GlobalErrorSink),
            relist_delay: Duration::from_secs(1),
            synced: AtomicBool::new(false),
        }
    }

    pub fn with_relist_delay(mut self, delay: Duration) -> Self {
        self.relist_delay = delay;
        self
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    async fn list_and_watch(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let objects = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            listed = self.source.list() => listed?,
        };
        self.sync_listing(objects);
        if !self.synced.swap(true, Ordering::AcqRel) {
            info!(objects = self.indexer.len(), "initial listing synced");
        }

        let mut events = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            watched = self.source.watch(shutdown.clone()) => watched?,
        };
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => {
                        debug!("watch closed, relisting");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Reconcile the cache against a full listing.
    fn sync_listing(&self, objects: Vec<V>) {
        let mut listed = HashSet::with_capacity(objects.len());
        for obj in objects {
            let existed = self
                .indexer
                .key_of(&obj)
                .map(|key| self.indexer.contains(&key))
                .unwrap_or(false);
            match self.indexer.add(obj) {
                Ok(key) => {
                    let change = if existed {
                        Change::update(key.clone())
                    } else {
                        Change::create(key.clone())
                    };
                    listed.insert(key);
                    self.queue.add(change);
                }
                Err(e) => self.error_sink.report(&anyhow::Error::new(e)),
            }
        }

        for key in self.indexer.list_keys() {
            if !listed.contains(&key) {
                self.indexer.delete(&key);
                self.queue.add(Change::delete(key));
            }
        }
    }

    fn apply(&self, event: WatchEvent<V>) {
        let result = match event {
            WatchEvent::Added(obj) => self.indexer.add(obj).map(Change::create),
            WatchEvent::Modified(obj) => self.indexer.add(obj).map(Change::update),
            WatchEvent::Deleted(obj) => self.indexer.key_of(&obj).map(|key| {
                self.indexer.delete(&key);
                Change::delete(key)
            }),
        };
        match result {
            Ok(change) => self.queue.add(change),
            Err(e) => self.error_sink.report(&anyhow::Error::new(e)),
        }
    }
}

#[async_trait]
impl<V: Send + Sync + 'static> Informer for ListWatchInformer<V> {
    async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            if let Err(e) = self.list_and_watch(&shutdown).await {
                warn!(error = %format_args!("{e:#}"), "list and watch failed");
                self.error_sink.report(&e);
            }
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.relist_delay) => {}
            }
        }
        debug!("informer stopped");
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
