use crate::error::{ConvoyError, ConvoyResult};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CONVOY__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

/// Location of the inference service every request is forwarded to.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    /// Header set to `true` on merged calls so the backend can tell them apart.
    #[serde(default = "default_flag_header")]
    pub flag_header: String,
    /// Extra time a caller waits past the window before giving up on its batch.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default)]
    pub endpoints: Vec<BatchEndpointConfig>,
}

/// One endpoint whose requests are aggregated into timed batches.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchEndpointConfig {
    pub name: String,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    /// Zipkin v2 span endpoint, e.g. `http://localhost:9411/api/v2/spans`.
    #[serde(default)]
    pub zipkin_api_url: Option<String>,
    #[serde(default = "default_trace_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_trace_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_trace_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_service_name() -> String {
    "convoy".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    5000
}
fn default_max_request_bytes() -> usize {
    20 * 1024 * 1024
}
fn default_backend_host() -> String {
    "localhost".to_string()
}
fn default_backend_port() -> u16 {
    5001
}
fn default_backend_timeout_ms() -> u64 {
    60_000
}
fn default_flag_header() -> String {
    "x-convoy-batch".to_string()
}
fn default_wait_timeout_ms() -> u64 {
    60_000
}
fn default_max_latency_ms() -> u64 {
    300
}
fn default_trace_batch_size() -> usize {
    100
}
fn default_trace_flush_interval_ms() -> u64 {
    1000
}
fn default_trace_queue_capacity() -> usize {
    10_000
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            timeout_ms: default_backend_timeout_ms(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            flag_header: default_flag_header(),
            wait_timeout_ms: default_wait_timeout_ms(),
            endpoints: Vec::new(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            zipkin_api_url: None,
            batch_size: default_trace_batch_size(),
            flush_interval_ms: default_trace_flush_interval_ms(),
            queue_capacity: default_trace_queue_capacity(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            api: ApiConfig::default(),
            backend: BackendConfig::default(),
            batching: BatchingConfig::default(),
            tracing: TracingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl BatchingConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Add or replace the window for `endpoint.name`.
    pub fn upsert_endpoint(&mut self, endpoint: BatchEndpointConfig) {
        match self.endpoints.iter_mut().find(|e| e.name == endpoint.name) {
            Some(existing) => existing.max_latency_ms = endpoint.max_latency_ms,
            None => self.endpoints.push(endpoint),
        }
    }
}

impl BatchEndpointConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }
}

/// Parses `name=millis` (or a bare `name`, which takes the default window).
impl FromStr for BatchEndpointConfig {
    type Err = ConvoyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, latency) = match s.split_once('=') {
            Some((name, ms)) => {
                let ms = ms.trim().parse::<u64>().map_err(|e| {
                    ConvoyError::Config(format!("invalid window for endpoint '{name}': {e}"))
                })?;
                (name.trim(), ms)
            }
            None => (s.trim(), default_max_latency_ms()),
        };
        validate_endpoint_name(name)?;
        Ok(Self {
            name: name.to_string(),
            max_latency_ms: latency,
        })
    }
}

fn validate_endpoint_name(name: &str) -> ConvoyResult<()> {
    if name.is_empty() {
        return Err(ConvoyError::Config("endpoint name must not be empty".into()));
    }
    if name.contains('/') {
        return Err(ConvoyError::Config(format!(
            "endpoint name '{name}' must be a single path segment"
        )));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from an optional TOML file and environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("CONVOY")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations the proxy could not serve correctly.
    pub fn validate(&self) -> ConvoyResult<()> {
        if self.backend.host.is_empty() {
            return Err(ConvoyError::Config("backend host must not be empty".into()));
        }
        if self.batching.flag_header.is_empty()
            || !self
                .batching
                .flag_header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ConvoyError::Config(format!(
                "invalid batch flag header '{}'",
                self.batching.flag_header
            )));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.batching.endpoints {
            validate_endpoint_name(&endpoint.name)?;
            if !seen.insert(endpoint.name.as_str()) {
                return Err(ConvoyError::Config(format!(
                    "endpoint '{}' is configured more than once",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }
}
