//! Health endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new().route("/ping", get(ping)).with_state(state)
}

async fn ping(State(state): State<AppState>) -> Json<Value> {
    state.telemetry.ping();
    Json(json!({ "message": format!("pong:{}", state.config.app_port) }))
}

/// Serves the health endpoint until the root scope is cancelled.
pub async fn serve(state: AppState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", state.config.app_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("health endpoint listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
