#![warn(clippy::unwrap_used)]

pub mod response;
pub mod rest;
pub mod routing;
pub mod server;
pub mod telemetry;
pub mod trace;

pub use response::ProxyResponse;
pub use routing::{BackendTarget, RoutingService};
pub use server::ApiServer;
pub use telemetry::{init_telemetry, shutdown_telemetry, TelemetryError};
pub use trace::{SpanGuard, SpanKind};
