//! Integration tests for the batched and relayed request flows.
//! Each test starts an in-process model backend on an ephemeral port.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use convoy_api::{server, BackendTarget, RoutingService};
use convoy_codec::InstancesCodec;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower::ServiceExt;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;

/// Routes spans on this thread through an in-memory exporter so trace ids exist.
struct SpanCapture {
    exporter: InMemorySpanExporter,
    _provider: TracerProvider,
    _guard: DefaultGuard,
}

impl SpanCapture {
    fn install() -> Self {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("convoy-test")));
        let guard = tracing::subscriber::set_default(subscriber);
        Self {
            exporter,
            _provider: provider,
            _guard: guard,
        }
    }

    fn names(&self) -> Vec<String> {
        self.exporter
            .get_finished_spans()
            .unwrap_or_default()
            .into_iter()
            .map(|span| span.name.into_owned())
            .collect()
    }
}

#[derive(Debug, Clone)]
struct BackendCall {
    path: &'static str,
    batched: bool,
    trace_id: Option<String>,
    instances: Vec<Value>,
}

type Calls = Arc<Mutex<Vec<BackendCall>>>;

fn record(calls: &Calls, path: &'static str, headers: &HeaderMap, instances: Vec<Value>) {
    calls.lock().unwrap().push(BackendCall {
        path,
        batched: headers.get("x-convoy-batch").and_then(|v| v.to_str().ok()) == Some("true"),
        trace_id: headers
            .get("x-b3-traceid")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        instances,
    });
}

fn instances_of(doc: &Value) -> Vec<Value> {
    doc["instances"].as_array().cloned().unwrap_or_default()
}

/// Multiplies every instance by ten, TF-Serving style.
async fn predict(State(calls): State<Calls>, headers: HeaderMap, Json(doc): Json<Value>) -> Json<Value> {
    let instances = instances_of(&doc);
    record(&calls, "predict", &headers, instances.clone());
    let predictions: Vec<Value> = instances
        .iter()
        .map(|v| json!(v.as_i64().unwrap_or(0) * 10))
        .collect();
    Json(json!({ "predictions": predictions }))
}

/// Drops the last prediction.
async fn short(State(calls): State<Calls>, headers: HeaderMap, Json(doc): Json<Value>) -> Json<Value> {
    let mut instances = instances_of(&doc);
    record(&calls, "short", &headers, instances.clone());
    instances.pop();
    Json(Value::Array(instances))
}

async fn broken(State(calls): State<Calls>, headers: HeaderMap) -> impl IntoResponse {
    record(&calls, "broken", &headers, Vec::new());
    (StatusCode::INTERNAL_SERVER_ERROR, "model exploded")
}

/// Echoes the body with a distinctive status and header.
async fn echo(State(calls): State<Calls>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    record(&calls, "echo", &headers, Vec::new());
    let mut reply = b"echo:".to_vec();
    reply.extend_from_slice(&body);
    (
        StatusCode::CREATED,
        [("x-model-version", "7"), ("content-type", "text/plain")],
        reply,
    )
}

/// A model that happens to be called `health`.
async fn health_model(State(calls): State<Calls>, headers: HeaderMap) -> impl IntoResponse {
    record(&calls, "health", &headers, Vec::new());
    (StatusCode::CREATED, "model says hi")
}

async fn spawn_backend() -> (u16, Calls) {
    let calls: Calls = Arc::default();
    let app = Router::new()
        .route("/predict", post(predict))
        .route("/short", post(short))
        .route("/broken", post(broken))
        .route("/echo", post(echo))
        .route("/health", post(health_model))
        .with_state(calls.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, calls)
}

fn proxy(port: u16, batch: &[(&str, u64)]) -> Router {
    let routing = RoutingService::new(
        BackendTarget::new("127.0.0.1", port).with_timeout(Duration::from_secs(5)),
        InstancesCodec::new(),
        reqwest::Client::new(),
    )
    .with_wait_timeout(Duration::from_secs(5));

    for (name, window_ms) in batch {
        routing.register_batchable(name, Duration::from_millis(*window_ms));
    }
    server::router(Arc::new(routing), "convoy-test", 1 << 20)
}

async fn send(app: &Router, path: &str, body: &str, headers: &[(&str, &str)]) -> (StatusCode, HeaderMap, Bytes) {
    let mut request = Request::builder().method("POST").uri(path);
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn body_json(body: &Bytes) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_staggered_requests_share_one_backend_call() {
    let spans = SpanCapture::install();
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 50)]);
    let start = Instant::now();

    let mut handles = Vec::new();
    for (delay_ms, value) in [(0u64, 1), (10, 2), (20, 3)] {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let body = json!({ "instances": [value] }).to_string();
            let (status, _, body) = send(&app, "/predict", &body, &[]).await;
            (status, body, start.elapsed())
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        let (status, body, elapsed) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(elapsed >= Duration::from_millis(50), "answered before window closed");
        outputs.push(body_json(&body));
    }
    assert_eq!(outputs, vec![json!([10]), json!([20]), json!([30])]);

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].batched);
    assert!(calls[0].trace_id.is_some());
    assert_eq!(calls[0].instances, vec![json!(1), json!(2), json!(3)]);

    let names = spans.names();
    assert_eq!(names.iter().filter(|n| *n == "handle request").count(), 3);
    assert_eq!(names.iter().filter(|n| *n == "merged predict").count(), 1);
}

#[tokio::test]
async fn test_undecodable_request_is_isolated() {
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 50)]);

    let bodies = [
        r#"{"instances": [1, 2]}"#,
        r#"{"instances": [oops"#,
        r#"{"instances": [3]}"#,
    ];
    let handles: Vec<_> = bodies
        .iter()
        .map(|body| {
            let app = app.clone();
            let body = body.to_string();
            tokio::spawn(async move { send(&app, "/predict", &body, &[]).await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    assert_eq!(results[0].0, StatusCode::OK);
    assert_eq!(body_json(&results[0].2), json!([10, 20]));
    assert_eq!(results[1].0, StatusCode::BAD_REQUEST);
    assert_eq!(body_json(&results[1].2)["error"], "bad_input");
    assert_eq!(results[2].0, StatusCode::OK);
    assert_eq!(body_json(&results[2].2), json!([30]));

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].instances, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_columnar_inputs_are_not_implemented() {
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 10)]);

    let (status, _, _) = send(&app, "/predict", r#"{"inputs": {"x": [1]}}"#, &[]).await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_backend_error_fails_every_batch_member() {
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("broken", 30)]);

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let body = json!({ "instances": [i] }).to_string();
                send(&app, "/broken", &body, &[]).await
            })
        })
        .collect();

    for handle in handles {
        let (status, _, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(&body)["error"], "batch_failed");
    }
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_short_backend_response_fails_the_batch() {
    let (port, _calls) = spawn_backend().await;
    let app = proxy(port, &[("short", 20)]);

    let (status, _, body) = send(&app, "/short", r#"{"instances": [1, 2]}"#, &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(&body)["error"], "batch_failed");
}

#[tokio::test]
async fn test_unregistered_endpoint_is_relayed_verbatim() {
    let _spans = SpanCapture::install();
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 50)]);
    let trace_id = "463ac35c9f6413ad48485a3953bb6124";

    let (status, headers, body) = send(
        &app,
        "/echo",
        "raw \u{1F600} payload",
        &[
            ("x-b3-traceid", trace_id),
            ("x-b3-spanid", "a2fb4a1d1a96d312"),
            ("x-b3-sampled", "1"),
            ("content-type", "text/plain"),
        ],
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(&body[..], "echo:raw \u{1F600} payload".as_bytes());
    assert_eq!(headers.get("x-model-version").unwrap(), "7");

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "echo");
    assert!(!calls[0].batched);
    assert_eq!(calls[0].trace_id.as_deref(), Some(trace_id));
}

#[tokio::test]
async fn test_relay_to_unreachable_backend_is_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let app = proxy(port, &[]);
    let (status, _, body) = send(&app, "/echo", "hello", &[]).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(&body)["error"], "relay_failed");
}

#[tokio::test]
async fn test_health_lists_batch_endpoints() {
    let (port, _calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 50), ("classify", 20)]);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/-/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health = body_json(&body);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["batch_endpoints"], json!(["classify", "predict"]));
}

#[tokio::test]
async fn test_model_named_health_is_relayed() {
    let (port, calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 50)]);

    let (status, _, body) = send(&app, "/health", "{}", &[]).await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(&body[..], b"model says hi");
    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "health");
}

#[tokio::test]
async fn test_operational_routes_answer_get() {
    let (port, _calls) = spawn_backend().await;
    let app = proxy(port, &[("predict", 10)]);

    for path in ["/-/ready", "/-/live"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path}");
    }
}
