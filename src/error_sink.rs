//! Process-wide sink for errors nobody else can handle.
//!
//! Handler errors that exhaust their retry budget and startup failures end up
//! here. [`handle_error`] always logs; extra handlers registered with
//! [`register_error_handler`] see every reported error too.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

type ErrorHandlerFn = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

static ERROR_HANDLERS: RwLock<Vec<ErrorHandlerFn>> = RwLock::new(Vec::new());

/// Somewhere to report errors that cannot be returned to a caller.
pub trait ErrorSink: Send + Sync {
    fn report(&self, err: &anyhow::Error);
}

/// Routes reports to [`handle_error`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalErrorSink;

impl ErrorSink for GlobalErrorSink {
    fn report(&self, err: &anyhow::Error) {
        handle_error(err);
    }
}

/// Log `err` with its cause chain and pass it to every registered handler.
pub fn handle_error(err: &anyhow::Error) {
    let chain = format!("{err:#}");
    error!(error = %chain, "unhandled error");

    let handlers = ERROR_HANDLERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for handler in handlers {
        handler(err);
    }
}

/// Add a handler that sees every error passed to [`handle_error`].
pub fn register_error_handler(handler: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
    ERROR_HANDLERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Arc::new(handler));
}
