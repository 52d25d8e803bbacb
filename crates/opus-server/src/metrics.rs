//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used by `GET /metrics`. Fails if a recorder is already
/// installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Metric names shared by the hub, the pumps and the HTTP layer.
pub mod names {
    /// Sessions registered (counter).
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    /// Sessions unregistered (counter).
    pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
    /// Registered sessions (gauge).
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    /// Inbound frames, well-formed or not (counter).
    pub const WS_FRAMES_RECEIVED_TOTAL: &str = "ws_frames_received_total";
    /// Inbound frames that failed to decode (counter).
    pub const WS_FRAMES_MALFORMED_TOTAL: &str = "ws_frames_malformed_total";
    /// Frames dropped on a full outbound queue (counter).
    pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
    /// Fan-outs executed by the hub (counter).
    pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
    /// Connection lifetime (histogram).
    pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
}
