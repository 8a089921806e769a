//! Error types for watcher-base.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("business handler not set; call set_handler before run")]
    HandlerNotSet,

    #[error("timed out waiting for caches to sync")]
    CacheSyncTimeout,

    #[error("index does not exist: {0}")]
    IndexNotFound(String),

    #[error("cannot compute key: {0}")]
    Key(String),

    #[error("business handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
