//! Request spans with B3 header propagation.
//!
//! Spans are ordinary `tracing` spans; the OpenTelemetry layer installed by
//! [`crate::telemetry`] assigns their ids and exports them. A [`SpanGuard`]
//! wraps one span for its whole scope so failures are recorded on every exit
//! path, including early returns.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_zipkin::{B3Encoding, Propagator};
use tracing::field::Empty;
use tracing::{debug, info_span, warn, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Every header the B3 propagator reads; cleared before injecting.
const B3_HEADERS: [&str; 6] = [
    "x-b3-traceid",
    "x-b3-spanid",
    "x-b3-parentspanid",
    "x-b3-sampled",
    "x-b3-flags",
    "b3",
];

/// Read-only view of request headers for the propagator.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}

/// Writable view of outbound headers for the propagator.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            self.0.insert(name, value);
        }
    }
}

fn propagator() -> Propagator {
    Propagator::with_encoding(B3Encoding::MultipleHeader)
}

/// The caller's span from B3 headers. Missing or malformed ids yield an empty context.
pub fn extract_context(headers: &HeaderMap) -> Context {
    propagator().extract_with_context(&Context::new(), &HeaderExtractor(headers))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Work done on behalf of an inbound request.
    Server,
    /// An outbound call to the backend.
    Client,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
        }
    }
}

/// An open span; closed when dropped, with its outcome already recorded.
pub struct SpanGuard {
    span: Span,
    error: Option<String>,
}

impl SpanGuard {
    /// Open a span named `name` for `endpoint`.
    ///
    /// A `parent` continues its trace; `None` starts a new one regardless of
    /// the span currently entered.
    pub fn start(
        name: impl Into<String>,
        kind: SpanKind,
        endpoint: &str,
        parent: Option<Context>,
    ) -> Self {
        let name = name.into();
        let span = info_span!(
            parent: None,
            "convoy",
            otel.name = name.as_str(),
            otel.kind = kind.as_str(),
            endpoint = endpoint,
            batch.size = Empty,
            http.status_code = Empty,
            otel.status_code = Empty,
            otel.status_message = Empty,
        );
        if let Some(parent) = parent {
            span.set_parent(parent);
        }
        Self { span, error: None }
    }

    /// The `tracing` span to instrument work with, so log lines carry it.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// OpenTelemetry context of this span, for parenting child spans.
    pub fn context(&self) -> Context {
        self.span.context()
    }

    /// Replace any B3 headers in `headers` with this span's identifiers.
    pub fn inject(&self, headers: &mut HeaderMap) {
        for name in B3_HEADERS {
            headers.remove(name);
        }
        propagator().inject_context(&self.context(), &mut HeaderInjector(headers));
    }

    pub fn record_batch_size(&self, size: usize) {
        self.span.record("batch.size", size);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.span.record("otel.status_code", "ERROR");
        self.span.record("otel.status_message", message.as_str());
        self.error = Some(message);
    }

    /// Tag the HTTP status; 5xx marks the span failed.
    pub fn record_status(&mut self, status: StatusCode) {
        self.span.record("http.status_code", status.as_u16());
        if status.is_server_error() && self.error.is_none() {
            self.record_error(status.to_string());
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        match &self.error {
            Some(error) => warn!(parent: &self.span, error = %error, "Span failed"),
            None => debug!(parent: &self.span, "Span finished"),
        }
    }
}
