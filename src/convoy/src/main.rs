//! Convoy: batching reverse proxy for model-serving backends.
//!
//! Main entry point that loads configuration, wires the routing service and
//! starts the server.

use clap::Parser;
use convoy_api::{init_telemetry, shutdown_telemetry, ApiServer, RoutingService};
use convoy_codec::InstancesCodec;
use convoy_core::config::{AppConfig, BatchEndpointConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(about = "Batching reverse proxy for model-serving backends")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', env = "CONVOY_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CONVOY__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Backend host (overrides config)
    #[arg(long, env = "CONVOY__BACKEND__HOST")]
    backend_host: Option<String>,

    /// Backend port (overrides config)
    #[arg(long, env = "CONVOY__BACKEND__PORT")]
    backend_port: Option<u16>,

    /// Batch an endpoint, as NAME=MILLIS or NAME (repeatable)
    #[arg(long = "batch", value_name = "NAME=MS")]
    batch: Vec<BatchEndpointConfig>,

    /// Zipkin v2 collector URL, e.g. http://zipkin:9411/api/v2/spans
    #[arg(long, env = "CONVOY__TRACING__ZIPKIN_API_URL")]
    zipkin_url: Option<String>,

    /// Serve Prometheus metrics on the configured metrics port
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging needs the tracing config, so a load failure is reported once it is up.
    let (mut config, load_error) = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => (config, None),
        Err(e) if cli.config.is_none() => (AppConfig::default(), Some(e)),
        Err(e) => return Err(e.into()),
    };

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(host) = cli.backend_host {
        config.backend.host = host;
    }
    if let Some(port) = cli.backend_port {
        config.backend.port = port;
    }
    for endpoint in cli.batch {
        config.batching.upsert_endpoint(endpoint);
    }
    if cli.zipkin_url.is_some() {
        config.tracing.zipkin_api_url = cli.zipkin_url;
    }
    if cli.metrics {
        config.metrics.enabled = true;
    }

    config.validate()?;
    init_telemetry(&config)?;

    info!("Convoy starting up");
    if let Some(e) = load_error {
        warn!(error = %e, "Failed to load config, using defaults");
    }

    info!(
        http_port = config.api.http_port,
        backend_host = %config.backend.host,
        backend_port = config.backend.port,
        batch_endpoints = config.batching.endpoints.len(),
        zipkin = config.tracing.zipkin_api_url.is_some(),
        "Configuration loaded"
    );

    let client = reqwest::Client::builder()
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()?;

    let routing = Arc::new(RoutingService::from_config(
        &config,
        InstancesCodec::new(),
        client,
    )?);

    let api_server = ApiServer::new(config.clone(), routing);

    if config.metrics.enabled {
        if let Err(e) = api_server.start_metrics().await {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    info!("Convoy is ready to serve traffic");

    // Blocks until shutdown
    let served = api_server.start_http().await;
    shutdown_telemetry();
    served?;

    Ok(())
}
