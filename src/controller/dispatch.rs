//! Worker dispatch loop and retry policy.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use super::{Handler, HandlerContext, MAX_REQUEUES, WORKER_RESTART_DELAY};
use crate::error::Error;
use crate::error_sink::ErrorSink;
use crate::model::Change;
use crate::queue::RateLimitingQueue;
use crate::telemetry::change::{Outcome, record_outcome, start_change_span};

/// Releases the queue lease on drop, so `done` runs on every path out of a
/// dispatch, unwinding included.
struct Lease<'a> {
    queue: &'a RateLimitingQueue<Change>,
    change: &'a Change,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        self.queue.done(self.change);
    }
}

/// Everything a worker needs, cheap to clone into each worker task.
pub(crate) struct Dispatcher<V> {
    queue: Arc<RateLimitingQueue<Change>>,
    context: HandlerContext<V>,
    handler: Arc<dyn Handler<V>>,
    error_sink: Arc<dyn ErrorSink>,
}

impl<V> Clone for Dispatcher<V> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            context: self.context.clone(),
            handler: Arc::clone(&self.handler),
            error_sink: Arc::clone(&self.error_sink),
        }
    }
}

impl<V: Send + Sync + 'static> Dispatcher<V> {
    pub(crate) fn new(
        queue: Arc<RateLimitingQueue<Change>>,
        context: HandlerContext<V>,
        handler: Arc<dyn Handler<V>>,
        error_sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            queue,
            context,
            handler,
            error_sink,
        }
    }

    /// Keep a worker alive until shutdown.
    ///
    /// Each pass runs the dispatch loop in its own task. A loop that returns
    /// normally is started again after [`WORKER_RESTART_DELAY`]; a loop that
    /// panics takes this worker out for good.
    pub(crate) async fn supervise(self, worker: usize, shutdown: CancellationToken) {
        loop {
            let dispatcher = self.clone();
            match tokio::spawn(async move { dispatcher.run_worker(worker).await }).await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    let panic = panic_message(e.into_panic().as_ref());
                    error!(worker, panic = %panic, "worker crashed, not restarting");
                    return;
                }
                Err(e) => {
                    warn!(worker, error = %e, "worker task cancelled");
                    return;
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(WORKER_RESTART_DELAY) => {}
            }
        }
    }

    async fn run_worker(&self, worker: usize) {
        while self.process_next_item(worker).await {}
    }

    /// Take one change off the queue and process it. False once the queue quits.
    pub(crate) async fn process_next_item(&self, worker: usize) -> bool {
        let Some(change) = self.queue.get().await else {
            return false;
        };
        let _lease = Lease {
            queue: &self.queue,
            change: &change,
        };

        let span = start_change_span(&change, worker, self.queue.num_requeues(&change));
        let errs = self.invoke(&change).instrument(span.clone()).await;
        let outcome = span.in_scope(|| self.handle_result(errs, &change));
        record_outcome(&span, outcome);
        true
    }

    /// Run the business handler, turning a panic into a handler error.
    async fn invoke(&self, change: &Change) -> Vec<anyhow::Error> {
        let call = self.handler.process_item(&self.context, change);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(errs) => errs,
            Err(payload) => {
                let panic = panic_message(payload.as_ref());
                error!(key = %change.key, panic = %panic, "business handler panicked");
                vec![Error::HandlerPanicked(panic).into()]
            }
        }
    }

    /// Forget on success, requeue with backoff while budget remains, drop after.
    fn handle_result(&self, errs: Vec<anyhow::Error>, change: &Change) -> Outcome {
        if errs.is_empty() {
            self.queue.forget(change);
            return Outcome::Succeeded;
        }

        if self.queue.num_requeues(change) < MAX_REQUEUES {
            info!(
                key = %change.key,
                action = %change.action,
                errors = %join_errors(&errs),
                "error processing change, requeueing"
            );
            self.queue.add_rate_limited(change.clone());
            return Outcome::Requeued;
        }

        self.queue.forget(change);
        for err in &errs {
            self.error_sink.report(err);
        }
        info!(
            key = %change.key,
            action = %change.action,
            errors = %join_errors(&errs),
            "dropping change out of the queue"
        );
        Outcome::Dropped
    }
}

fn join_errors(errs: &[anyhow::Error]) -> String {
    errs.iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
