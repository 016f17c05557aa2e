//! REST handlers: the proxied model endpoints and health checks.

use crate::response::ProxyResponse;
use crate::routing::RoutingService;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use convoy_codec::PayloadCodec;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for REST handlers.
pub struct AppState<C: PayloadCodec> {
    pub routing: Arc<RoutingService<C>>,
    pub service_name: String,
    pub start_time: Instant,
}

impl<C: PayloadCodec> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            routing: self.routing.clone(),
            service_name: self.service_name.clone(),
            start_time: self.start_time,
        }
    }
}

/// POST /:name: batched or relayed to the backend endpoint of the same name.
pub async fn handle_endpoint<C: PayloadCodec>(
    State(state): State<AppState<C>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResponse {
    state.routing.handle(&name, &headers, body).await
}

/// GET /-/health: uptime and batch endpoints.
pub async fn health_check<C: PayloadCodec>(State(state): State<AppState<C>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.service_name.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        batch_endpoints: state.routing.batch_endpoints(),
    })
}

/// GET /-/ready: Kubernetes readiness check.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /-/live: Kubernetes liveness check.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub uptime_secs: u64,
    pub batch_endpoints: Vec<String>,
}
