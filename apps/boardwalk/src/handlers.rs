use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.signaling.stats())
}

/// STUN/TURN servers for `RTCPeerConnection` configuration.
pub async fn ice_config_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ice.as_ref().clone())
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
