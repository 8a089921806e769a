//! Event sources that keep a local cache and feed changes into the queue.

pub mod list_watch;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use list_watch::{ListWatch, ListWatchInformer, WatchEvent};

/// How often [`wait_for_cache_sync`] re-checks readiness.
pub const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An asynchronous producer of changes backed by a local cache.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Run until `shutdown` is cancelled.
    async fn run(&self, shutdown: CancellationToken);

    /// True once the initial listing has been reflected into the cache.
    fn has_synced(&self) -> bool;
}

/// Poll `has_synced` every `poll` until it returns true or `shutdown` fires.
///
/// Returns false only when shutdown came first.
pub async fn wait_for_cache_sync(
    shutdown: &CancellationToken,
    poll: Duration,
    has_synced: impl Fn() -> bool,
) -> bool {
    loop {
        if has_synced() {
            debug!("caches synced");
            return true;
        }
        tokio::select! {
            () = shutdown.cancelled() => return false,
            () = tokio::time::sleep(poll) => {}
        }
    }
}
