//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

use crate::websocket::hub::HubStats;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while the hub answers, `"degraded"` otherwise.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered sessions.
    pub connections: usize,
    /// Known channels.
    pub channels: usize,
}

/// Build a health response. `stats` is `None` when the hub did not answer.
pub fn health_check(start_time: Instant, stats: Option<HubStats>) -> HealthResponse {
    let status = if stats.is_some() { "ok" } else { "degraded" };
    let stats = stats.unwrap_or_default();
    HealthResponse {
        status: status.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: stats.sessions,
        channels: stats.channels,
    }
}
