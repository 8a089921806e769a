//! Typed configuration from a TOML file and environment variables.
//!
//! Loads once at startup and fails fast on anything invalid. Every field has
//! a default, so an empty environment yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Change;
use crate::queue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of parallel workers.
    pub workers: usize,
    /// How often the directory source re-reads its directory.
    pub poll_interval_ms: u64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// OTLP endpoint for traces and logs.
    pub otel_endpoint: Option<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 2000,
            log_level: "info".to_string(),
            otel_endpoint: None,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Parameters of the controller's rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// First per-item retry delay; doubles on every failure.
    pub base_delay_ms: u64,
    /// Ceiling for the per-item retry delay.
    pub max_delay_ms: u64,
    /// Overall retry rate across all items.
    pub qps: f64,
    /// Retries allowed back to back before `qps` applies.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl RateLimitConfig {
    /// Per-item exponential backoff bounded by the overall bucket.
    pub fn build(&self) -> MaxOfRateLimiter<Change> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

impl Config {
    /// Load configuration from a TOML file. Missing fields take their defaults.
    ///
    /// An unreadable file is [`Error::Io`], bad TOML [`Error::Toml`], and
    /// out-of-range values [`Error::Config`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the environment.
    ///
    /// Starts from the file named by `WATCHER_CONFIG` (or the defaults), then
    /// applies `WATCHER_WORKERS`, `WATCHER_POLL_INTERVAL_MS`, `LOG_LEVEL` and
    /// `OTEL_ENDPOINT`. In local dev, call `dotenvy::dotenv().ok()` first.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("WATCHER_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(workers) = parsed_var("WATCHER_WORKERS")? {
            config.workers = workers;
        }
        if let Some(poll) = parsed_var("WATCHER_POLL_INTERVAL_MS")? {
            config.poll_interval_ms = poll;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            config.otel_endpoint = Some(endpoint);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        let limits = &self.rate_limit;
        if !(limits.qps > 0.0) {
            return Err(Error::Config("rate_limit.qps must be positive".to_string()));
        }
        if limits.burst == 0 {
            return Err(Error::Config("rate_limit.burst must be positive".to_string()));
        }
        if limits.base_delay_ms > limits.max_delay_ms {
            return Err(Error::Config(format!(
                "rate_limit.base_delay_ms ({}) exceeds max_delay_ms ({})",
                limits.base_delay_ms, limits.max_delay_ms
            )));
        }
        Ok(())
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
