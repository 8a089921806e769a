//! Log and trace output for a controller process.
//!
//! Every controller log line and `change.process` span goes to stderr through
//! a fmt layer. With an OTLP collector configured the same spans and events
//! are shipped over gRPC too, so a dropped change can be followed from its
//! first failure to the error-sink report.

pub mod change;

use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Tracer name under which change spans are exported.
const TRACER_NAME: &str = "watcher-base";

/// Where and how verbosely to report.
pub struct TelemetryConfig {
    /// OTLP gRPC collector, e.g. `http://localhost:4317`. `None` keeps output local.
    pub endpoint: Option<String>,
    /// `service.name` attached to exported spans and logs.
    pub service_name: String,
    /// Directive used when `RUST_LOG` is unset or unparsable.
    pub log_level: String,
}

/// Keeps the OTLP exporters alive.
///
/// Batched spans and log records for the last changes a controller handled
/// are only sent when this guard is flushed or dropped, so hold it until
/// `Controller::run` has returned.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
    logger_provider: Option<SdkLoggerProvider>,
}

impl TelemetryGuard {
    /// Push out whatever the batch exporters are holding.
    pub fn force_flush(&self) {
        if let Some(provider) = &self.tracer_provider {
            let _ = provider.force_flush();
        }
        if let Some(provider) = &self.logger_provider {
            let _ = provider.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.logger_provider.take() {
            let _ = provider.shutdown();
        }
        if let Some(provider) = self.tracer_provider.take() {
            let _ = provider.shutdown();
        }
    }
}

/// Install the global subscriber for this process.
///
/// # Errors
///
/// Fails when an OTLP exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = env_filter(&config.log_level);
    let subscriber = tracing_subscriber::registry().with(filter);

    let Some(endpoint) = config.endpoint else {
        subscriber
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard {
            tracer_provider: None,
            logger_provider: None,
        });
    };

    let (tracer_provider, logger_provider) = otlp_providers(&endpoint, config.service_name)?;
    let span_layer =
        tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(TRACER_NAME));
    let log_layer =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logger_provider);

    subscriber
        .with(tracing_subscriber::fmt::layer().compact())
        .with(span_layer)
        .with(log_layer)
        .try_init()
        .map_err(subscriber_error)?;

    Ok(TelemetryGuard {
        tracer_provider: Some(tracer_provider),
        logger_provider: Some(logger_provider),
    })
}

/// `RUST_LOG` wins; otherwise the configured level; otherwise `info`.
fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Batch span and log pipelines sharing one resource, both exporting to `endpoint`.
fn otlp_providers(
    endpoint: &str,
    service_name: String,
) -> Result<(SdkTracerProvider, SdkLoggerProvider)> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name)
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP span exporter for {endpoint}: {e}")))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::Other(format!("OTLP log exporter for {endpoint}: {e}")))?;

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();
    let logger_provider = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();
    Ok((tracer_provider, logger_provider))
}

fn subscriber_error(e: tracing_subscriber::util::TryInitError) -> Error {
    Error::Other(format!("tracing subscriber already installed: {e}"))
}
