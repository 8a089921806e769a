//! # watcher-base
//!
//! Change-processing controller in the reconciler style.
//!
//! An informer keeps a local cache of resources and turns every create,
//! update and delete into a [`model::Change`] on a deduplicating,
//! rate-limited [`queue::RateLimitingQueue`]. A [`controller::Controller`]
//! runs a fixed pool of workers over that queue, hands each change to a
//! [`controller::Handler`], and retries failures with backoff up to a fixed
//! budget before dropping them into the [`error_sink`].

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod error_sink;
pub mod informer;
pub mod model;
pub mod queue;
pub mod source;
pub mod telemetry;
