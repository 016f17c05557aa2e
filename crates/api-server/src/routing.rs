//! Routing service: sends each request either through its endpoint's batch
//! dispatcher or straight to the backend.

use crate::response::ProxyResponse;
use crate::trace::{extract_context, SpanGuard, SpanKind};
use async_trait::async_trait;
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use convoy_batching::{BatchDispatcher, BatchError, BulkHandler, DispatcherConfig};
use convoy_codec::{CodecError, PayloadCodec};
use convoy_core::config::{AppConfig, BackendConfig};
use convoy_core::error::{ConvoyError, ConvoyResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use opentelemetry::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Where backend calls go.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl BackendTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url_for(&self, endpoint: &str) -> String {
        format!("http://{}:{}/{}", self.host, self.port, endpoint)
    }
}

impl From<&BackendConfig> for BackendTarget {
    fn from(config: &BackendConfig) -> Self {
        Self::new(config.host.clone(), config.port).with_timeout(config.timeout())
    }
}

type EndpointDispatcher<C> = BatchDispatcher<<C as PayloadCodec>::Input, ProxyResponse>;

/// Front door of the proxy: one optional dispatcher per endpoint name.
pub struct RoutingService<C: PayloadCodec> {
    backend: BackendTarget,
    client: reqwest::Client,
    codec: Arc<C>,
    flag_header: HeaderName,
    wait_timeout: Duration,
    dispatchers: DashMap<String, Arc<EndpointDispatcher<C>>>,
}

impl<C: PayloadCodec> RoutingService<C> {
    pub fn new(backend: BackendTarget, codec: C, client: reqwest::Client) -> Self {
        Self {
            backend,
            client,
            codec: Arc::new(codec),
            flag_header: HeaderName::from_static("x-convoy-batch"),
            wait_timeout: Duration::from_secs(60),
            dispatchers: DashMap::new(),
        }
    }

    pub fn with_flag_header(mut self, flag_header: HeaderName) -> Self {
        self.flag_header = flag_header;
        self
    }

    /// Extra time a batched caller waits past the window before getting a 504.
    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Build the service and register every configured batch endpoint.
    pub fn from_config(
        config: &AppConfig,
        codec: C,
        client: reqwest::Client,
    ) -> ConvoyResult<Self> {
        let flag_header = HeaderName::from_bytes(config.batching.flag_header.as_bytes())
            .map_err(|e| ConvoyError::Config(format!("invalid batch flag header: {e}")))?;

        let service = Self::new(BackendTarget::from(&config.backend), codec, client)
            .with_flag_header(flag_header)
            .with_wait_timeout(config.batching.wait_timeout());

        for endpoint in &config.batching.endpoints {
            service.register_batchable(&endpoint.name, endpoint.window());
        }
        Ok(service)
    }

    pub fn backend(&self) -> &BackendTarget {
        &self.backend
    }

    /// Route `endpoint` through a batch dispatcher with the given window.
    ///
    /// Idempotent: returns `false` and keeps the existing dispatcher if the
    /// endpoint is already registered.
    pub fn register_batchable(&self, endpoint: &str, window: Duration) -> bool {
        match self.dispatchers.entry(endpoint.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let handler = Arc::new(MergedBackendCall {
                    endpoint: endpoint.to_string(),
                    url: self.backend.url_for(endpoint),
                    timeout: self.backend.timeout,
                    client: self.client.clone(),
                    codec: self.codec.clone(),
                    flag_header: self.flag_header.clone(),
                });
                let config = DispatcherConfig::new(window).with_wait_timeout(self.wait_timeout);
                slot.insert(Arc::new(BatchDispatcher::new(endpoint, config, handler)));

                info!(
                    endpoint = %endpoint,
                    window_ms = window.as_millis() as u64,
                    "Batch endpoint registered"
                );
                true
            }
        }
    }

    pub fn is_batchable(&self, endpoint: &str) -> bool {
        self.dispatchers.contains_key(endpoint)
    }

    /// Registered batch endpoints, sorted by name.
    pub fn batch_endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dispatchers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Handle one inbound request for `endpoint`.
    pub async fn handle(&self, endpoint: &str, headers: &HeaderMap, body: Bytes) -> ProxyResponse {
        let mut span = SpanGuard::start(
            "handle request",
            SpanKind::Server,
            endpoint,
            Some(extract_context(headers)),
        );
        let instrument = span.span().clone();

        // Clone the Arc out so no map guard is held across an await.
        let dispatcher = self.dispatchers.get(endpoint).map(|d| d.value().clone());

        let response = match dispatcher {
            Some(dispatcher) => {
                metrics::counter!("proxy.requests", "mode" => "batched").increment(1);
                self.handle_batched(&dispatcher, &body, &mut span)
                    .instrument(instrument)
                    .await
            }
            None => {
                metrics::counter!("proxy.requests", "mode" => "relay").increment(1);
                self.relay(endpoint, headers, body, span.context())
                    .instrument(instrument)
                    .await
            }
        };

        span.record_status(response.status);
        response
    }

    async fn handle_batched(
        &self,
        dispatcher: &EndpointDispatcher<C>,
        body: &[u8],
        span: &mut SpanGuard,
    ) -> ProxyResponse {
        let input = match self.codec.decode(body) {
            Ok(input) => input,
            Err(e) => {
                metrics::counter!("proxy.decode_errors").increment(1);
                debug!(endpoint = %dispatcher.name(), error = %e, "Request could not be decoded");
                span.record_error(e.to_string());
                return codec_error_response(&e);
            }
        };

        let result = dispatcher.submit(input).await;
        if let Err(e) = &result {
            span.record_error(e.to_string());
        }

        match result {
            Ok(response) => response,
            Err(BatchError::Timeout(ms)) => ProxyResponse::error(
                StatusCode::GATEWAY_TIMEOUT,
                "batch_timeout",
                format!("Batch did not complete within {ms} ms"),
            ),
            Err(e) => {
                warn!(endpoint = %dispatcher.name(), error = %e, "Batched request failed");
                ProxyResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "batch_failed",
                    "Backend call for this batch failed",
                )
            }
        }
    }

    /// Forward the request verbatim and return the backend's answer verbatim.
    async fn relay(
        &self,
        endpoint: &str,
        headers: &HeaderMap,
        body: Bytes,
        parent: Context,
    ) -> ProxyResponse {
        let url = self.backend.url_for(endpoint);
        let mut span = SpanGuard::start(
            format!("{endpoint} relay"),
            SpanKind::Client,
            endpoint,
            Some(parent),
        );

        let mut outbound = end_to_end_headers(headers);
        span.inject(&mut outbound);

        let sent = self
            .client
            .post(&url)
            .headers(outbound)
            .timeout(self.backend.timeout)
            .body(body)
            .send()
            .await;

        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!("proxy.relay_errors").increment(1);
                warn!(url = %url, error = %e, "Relay to backend failed");
                span.record_error(e.to_string());
                return ProxyResponse::error(
                    StatusCode::BAD_GATEWAY,
                    "relay_failed",
                    "Backend is unreachable",
                );
            }
        };

        let status = response.status();
        let headers = end_to_end_headers(response.headers());
        match response.bytes().await {
            Ok(body) => {
                span.record_status(status);
                ProxyResponse::new(status, headers, body)
            }
            Err(e) => {
                metrics::counter!("proxy.relay_errors").increment(1);
                warn!(url = %url, error = %e, "Reading relayed response failed");
                span.record_error(e.to_string());
                ProxyResponse::error(
                    StatusCode::BAD_GATEWAY,
                    "relay_failed",
                    "Backend response was interrupted",
                )
            }
        }
    }
}

fn codec_error_response(error: &CodecError) -> ProxyResponse {
    match error {
        CodecError::Unsupported(msg) => {
            ProxyResponse::error(StatusCode::NOT_IMPLEMENTED, "not_implemented", msg.clone())
        }
        _ => ProxyResponse::error(StatusCode::BAD_REQUEST, "bad_input", error.to_string()),
    }
}

/// Copy `headers` without hop-by-hop and length headers; the client sets its own.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(name);
    }
    forwarded.remove(header::CONTENT_LENGTH);
    forwarded
}

/// The bulk call bound to one batch endpoint: merge, one POST, split.
struct MergedBackendCall<C: PayloadCodec> {
    endpoint: String,
    url: String,
    timeout: Duration,
    client: reqwest::Client,
    codec: Arc<C>,
    flag_header: HeaderName,
}

#[async_trait]
impl<C: PayloadCodec> BulkHandler<C::Input, ProxyResponse> for MergedBackendCall<C> {
    async fn handle_batch(&self, inputs: Vec<C::Input>) -> Result<Vec<ProxyResponse>, BatchError> {
        // A merged call serves many traces, so it starts its own.
        let mut span = SpanGuard::start(
            format!("merged {}", self.endpoint),
            SpanKind::Client,
            &self.endpoint,
            None,
        );
        span.record_batch_size(inputs.len());

        let result = self
            .call(inputs, &span)
            .instrument(span.span().clone())
            .await;

        if let Err(e) = &result {
            span.record_error(e.to_string());
        }
        result
    }
}

impl<C: PayloadCodec> MergedBackendCall<C> {
    async fn call(
        &self,
        inputs: Vec<C::Input>,
        span: &SpanGuard,
    ) -> Result<Vec<ProxyResponse>, BatchError> {
        let merged = self
            .codec
            .merge(inputs)
            .map_err(|e| BatchError::Backend(e.to_string()))?;

        let mut headers = HeaderMap::new();
        span.inject(&mut headers);
        headers.insert(self.flag_header.clone(), HeaderValue::from_static("true"));
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.codec.content_type()),
        );

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .timeout(self.timeout)
            .body(merged.body)
            .send()
            .await
            .map_err(|e| BatchError::Backend(format!("request to {} failed: {e}", self.url)))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| BatchError::Backend(format!("reading response failed: {e}")))?;
        if !status.is_success() {
            return Err(BatchError::Backend(format!("backend returned {status}")));
        }

        let outputs = self
            .codec
            .split(&body, &merged.slices)
            .map_err(|e| BatchError::Backend(e.to_string()))?;

        debug!(endpoint = %self.endpoint, size = outputs.len(), "Merged call returned");
        Ok(outputs.into_iter().map(|output| self.reply(output)).collect())
    }

    fn reply(&self, output: C::Output) -> ProxyResponse {
        match self.codec.encode(output) {
            Ok(body) => ProxyResponse::with_content_type(StatusCode::OK, self.codec.content_type(), body),
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Encoding batched output failed");
                ProxyResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "encode_failed",
                    "Output could not be encoded",
                )
            }
        }
    }
}
