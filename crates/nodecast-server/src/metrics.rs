//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup before
/// any metrics are recorded; a second call fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// RPC requests total (counter, labels: method).
pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
/// RPC errors total (counter, labels: method, error_type).
pub const RPC_ERRORS_TOTAL: &str = "rpc_errors_total";
/// RPC request duration seconds (histogram, labels: method).
pub const RPC_REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Connections accepted total (counter, labels: transport).
pub const CONNECTIONS_TOTAL: &str = "connections_total";
/// Connections refused because of `max_connections` (counter, labels: transport).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "connections_rejected_total";
/// Disconnections total (counter, labels: transport).
pub const DISCONNECTIONS_TOTAL: &str = "disconnections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "connections_active";
/// Connection lifetime (histogram, labels: transport).
pub const CONNECTION_DURATION_SECONDS: &str = "connection_duration_seconds";
/// Transport faults (counter, labels: transport, fatal).
pub const TRANSPORT_ERRORS_TOTAL: &str = "transport_errors_total";
/// Broadcast deliveries dropped (counter, labels: reason).
pub const CHANNEL_BROADCAST_DROPS_TOTAL: &str = "channel_broadcast_drops_total";
