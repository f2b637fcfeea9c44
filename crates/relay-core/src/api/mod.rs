//! HTTP/WebSocket surface: the downlink subscriber endpoint and a health check.
//!
//! This module contains thin handlers that delegate to [`crate::subscribers`].

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::error::RelayResult;
use crate::signals::EventSignals;
use crate::subscribers::SubscriberRegistry;

pub mod ws;

/// Shared application state for the API layer.
#[derive(Clone)]
pub struct AppState {
    /// Registry of connected downlink subscribers.
    pub subscribers: Arc<SubscriberRegistry>,
    /// Cross-task event flags, exposed here so `/healthz` can report stop state.
    pub signals: Arc<EventSignals>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/subtitles", get(ws::subtitles_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz(State(_state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Serves the downlink HTTP/WebSocket surface on an already-bound listener
/// until it errors. The listener is bound in [`crate::bootstrap::bootstrap`]
/// so a bind failure surfaces from `bootstrap()` itself rather than being
/// silently swallowed by a detached server task.
pub async fn start_server(state: AppState, listener: tokio::net::TcpListener) -> RelayResult<()> {
    log::info!(
        "downlink server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| crate::error::RelayError::Internal(e.to_string()))?;
    Ok(())
}
