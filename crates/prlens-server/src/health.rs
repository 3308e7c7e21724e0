//! `/health` endpoint.

use std::time::Instant;

use prlens_upstream::ConnectorState;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server answers.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Upstream connector state.
    pub upstream: ConnectorState,
    /// Live session subscriptions.
    pub subscriptions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    upstream: ConnectorState,
    subscriptions: usize,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        upstream,
        subscriptions,
    }
}
