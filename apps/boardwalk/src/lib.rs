//! Boardwalk pairs anonymous clients into 1:1 WebRTC sessions and relays
//! their offer/answer/candidate exchange over WebSockets.
//!
//! ```text
//! boardwalk
//!   ├─ websocket       (axum upgrade, per-connection reader + writer)
//!   ├─ SignalingState  (dispatch, delivery, idle monitor)
//!   │   ├─ ConnectionRegistry  (connection id -> outbound channel)
//!   │   └─ Matchmaker          (one lock around pool + partnerships)
//!   │       ├─ WaitingPool
//!   │       └─ PartnershipTable
//!   └─ handlers        (/health, /debug/stats, /metrics, /ice-config)
//! ```

pub mod cli;
pub mod config;
pub mod handlers;
pub mod matchmaker;
mod partners;
mod pool;
pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod telemetry;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{IceConfig, ServerConfig};
use crate::signaling::SignalingState;

#[derive(Clone)]
pub struct AppState {
    pub signaling: SignalingState,
    pub ice: Arc<IceConfig>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: Option<PrometheusHandle>) -> Self {
        Self {
            signaling: SignalingState::new(config.signaling.clone()),
            ice: Arc::new(config.ice.clone()),
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/debug/stats", get(handlers::stats_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ice-config", get(handlers::ice_config_handler))
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let monitor = state.signaling.spawn_idle_monitor();
    let app = router(state);

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error");

    if let Some(monitor) = monitor {
        monitor.abort();
    }
    result
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, "boardwalk listening");

    let state = AppState::new(&config, metrics);
    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
