//! API server: serves the proxy router and the optional metrics listener.

use crate::rest::{self, AppState};
use crate::routing::RoutingService;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use convoy_codec::PayloadCodec;
use convoy_core::config::AppConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the proxy router around a routing service.
pub fn router<C: PayloadCodec>(
    routing: Arc<RoutingService<C>>,
    service_name: impl Into<String>,
    max_request_bytes: usize,
) -> Router {
    let state = AppState {
        routing,
        service_name: service_name.into(),
        start_time: Instant::now(),
    };

    Router::new()
        // Operational endpoints; the `/-/` prefix is never a model name
        .route("/-/health", get(rest::health_check::<C>))
        .route("/-/ready", get(rest::readiness))
        .route("/-/live", get(rest::liveness))
        // Model endpoints, batched or relayed
        .route("/:name", post(rest::handle_endpoint::<C>))
        // Middleware
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Main API server for the proxy.
pub struct ApiServer<C: PayloadCodec> {
    config: AppConfig,
    routing: Arc<RoutingService<C>>,
}

impl<C: PayloadCodec> ApiServer<C> {
    pub fn new(config: AppConfig, routing: Arc<RoutingService<C>>) -> Self {
        Self { config, routing }
    }

    pub fn router(&self) -> Router {
        router(
            self.routing.clone(),
            self.config.service_name.clone(),
            self.config.api.max_request_bytes,
        )
    }

    /// Start the HTTP server; returns after a shutdown signal.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(
            addr = %addr,
            backend = %self.routing.backend().url_for(""),
            batch_endpoints = ?self.routing.batch_endpoints(),
            "Starting HTTP server"
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
