//! Logging and span export setup.
//!
//! ```text
//! tracing spans  -->  tracing-opentelemetry  -->  OpenTelemetry SDK  -->  Zipkin
//! ```
//!
//! The OpenTelemetry layer is always installed so B3 ids are generated and
//! propagated; spans are only exported when a Zipkin collector is configured.

use convoy_core::config::{AppConfig, TracingConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, TracerProvider};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "convoy=info,convoy_api=info,tower_http=info";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to initialize Zipkin exporter: {0}")]
    ZipkinInit(String),

    #[error("failed to install tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Build the tracer provider, with a batching Zipkin exporter if a collector URL is set.
pub fn tracer_provider(
    service_name: &str,
    config: &TracingConfig,
) -> Result<TracerProvider, TelemetryError> {
    let Some(url) = &config.zipkin_api_url else {
        return Ok(TracerProvider::builder().build());
    };

    let exporter = opentelemetry_zipkin::new_pipeline()
        .with_service_name(service_name)
        .with_collector_endpoint(url)
        .init_exporter()
        .map_err(|e| TelemetryError::ZipkinInit(e.to_string()))?;

    let batch = BatchConfigBuilder::default()
        .with_max_queue_size(config.queue_capacity.max(1))
        .with_max_export_batch_size(config.batch_size.max(1))
        .with_scheduled_delay(Duration::from_millis(config.flush_interval_ms.max(1)))
        .build();
    let processor = BatchSpanProcessor::builder(exporter, runtime::Tokio)
        .with_batch_config(batch)
        .build();

    Ok(TracerProvider::builder()
        .with_span_processor(processor)
        .build())
}

/// Install JSON logging and span export for the process.
///
/// `RUST_LOG` filters log output only; spans always reach the exporter.
pub fn init_telemetry(config: &AppConfig) -> Result<(), TelemetryError> {
    let provider = tracer_provider(&config.service_name, &config.tracing)?;
    let tracer = provider.tracer("convoy");

    // Registered globally so shutdown_telemetry() can flush pending spans.
    opentelemetry::global::set_tracer_provider(provider);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    tracing_subscriber::registry()
        .with(fmt::layer().json().with_filter(filter))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

/// Flush pending spans and stop the exporter.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
