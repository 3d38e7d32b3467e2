use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::{RelayConfig, SessionSettings};
use crate::echo;
use crate::registry::PeerRegistry;
use crate::session::{self, SessionPhase};

/// Shared by every handler.
#[derive(Clone)]
pub struct RelayState {
    pub registry: PeerRegistry,
    pub settings: Arc<SessionSettings>,
    metrics: Option<PrometheusHandle>,
}

impl RelayState {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            registry: PeerRegistry::new(),
            settings: Arc::new(settings),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Out-of-band identification on the upgrade request, e.g. `/rtc?peer_id=alice`.
#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub peer_id: Option<String>,
}

pub fn router(state: RelayState, echo_path: &str, signal_path: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(echo_path, get(echo_handler))
        .route(signal_path, get(signal_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

pub async fn run(config: RelayConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let mut state = RelayState::new(config.session.clone());
    if let Some(handle) = metrics {
        state = state.with_metrics(handle);
    }
    let app = router(state, &config.echo_path, &config.signal_path);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;

    info!("beach-relay listening on {}", local_addr);
    info!("echo endpoint: ws://{}{}", local_addr, config.echo_path);
    info!("signal endpoint: ws://{}{}", local_addr, config.signal_path);

    serve(listener, app, shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "peers": state.registry.len() }))
}

async fn metrics_handler(State(state): State<RelayState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn echo_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| echo::run(socket, remote_addr))
}

async fn signal_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
    Query(query): Query<JoinQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(%remote_addr, phase = %SessionPhase::Connecting, "signaling upgrade requested");
    let registry = state.registry.clone();
    let settings = (*state.settings).clone();
    ws.on_upgrade(move |socket| session::run(socket, registry, settings, query.peer_id, remote_addr))
}
