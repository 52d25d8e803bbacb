//! `GatewayServer`: axum HTTP + WebSocket front end for the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::header::ORIGIN;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use opus_settings::ServerSettings;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::errors::GatewayError;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::hub::{Hub, HubConfig, HubHandle};
use crate::websocket::pump::{self, PumpConfig};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Hub client.
    pub hub: HubHandle,
    /// Server settings.
    pub settings: Arc<ServerSettings>,
    /// Per-connection settings derived from `settings`.
    pub pump: PumpConfig,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The gateway server. Owns the hub for the process lifetime.
pub struct GatewayServer {
    settings: Arc<ServerSettings>,
    hub: HubHandle,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl GatewayServer {
    /// Create the server and start its hub. Must be called inside a tokio runtime.
    pub fn new(settings: ServerSettings, metrics: Option<PrometheusHandle>) -> Self {
        let (hub, hub_task) = Hub::spawn(HubConfig::from(&settings));
        Self {
            settings: Arc::new(settings),
            hub,
            hub_task: Mutex::new(Some(hub_task)),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            settings: Arc::clone(&self.settings),
            pump: PumpConfig::from(self.settings.as_ref()),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .layer(cors_layer(&self.settings.allowed_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Cancelling the [`ShutdownCoordinator`] token shuts the hub down, which
    /// closes every session, then stops accepting connections.
    pub async fn listen(
        &self,
    ) -> Result<(SocketAddr, JoinHandle<Result<(), GatewayError>>), GatewayError> {
        let addr = self.settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener
            .local_addr()
            .map_err(|source| GatewayError::Bind { addr, source })?;

        if self.settings.allowed_origins.is_empty() {
            warn!("origin allow-list is empty, accepting upgrades from any origin");
        }
        info!(addr = %local, "gateway listening");

        let app = self.router();
        let token = self.shutdown.token();
        let hub = self.hub.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    token.cancelled().await;
                    info!("shutting down hub");
                    if let Err(e) = hub.shutdown().await {
                        debug!(error = %e, "hub already stopped");
                    }
                })
                .await
                .map_err(GatewayError::Serve)?;
            info!("gateway stopped");
            Ok::<(), GatewayError>(())
        });

        Ok((local, handle))
    }

    /// Hub client, for injecting server-originated frames.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Take the hub's task handle so it can be awaited during drain.
    pub fn take_hub_task(&self) -> Option<JoinHandle<()>> {
        self.hub_task.lock().take()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }
}

/// Whether an upgrade from `origin` is permitted. An empty allow-list
/// accepts everything, `"*"` matches any origin.
pub fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin.and_then(|v| v.to_str().ok()) else {
        return false;
    };
    allowed.iter().any(|a| a == "*" || a == origin)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    if allowed.is_empty() || allowed.iter().any(|a| a == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET])
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats().await.ok();
    Json(health::health_check(state.start_time, stats))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(ORIGIN);
    if !origin_allowed(&state.settings.allowed_origins, origin) {
        warn!(origin = ?origin, "rejecting upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }
    let hub = state.hub.clone();
    let config = state.pump;
    ws.max_message_size(state.settings.max_message_size)
        .on_upgrade(move |socket| pump::accept(socket, hub, config))
}
