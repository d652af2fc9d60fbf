//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the broker is running.
    pub status: String,
    /// Seconds since the broker started.
    pub uptime_secs: u64,
    /// Live clients across both listeners.
    pub connections: usize,
    /// Registered nodes.
    pub nodes: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, nodes: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        nodes,
    }
}
