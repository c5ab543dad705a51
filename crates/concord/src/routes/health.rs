//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::sync::Arc;

use crate::context::ClusterContext;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    node_id: String,
}

/// Basic health check (is the server running?)
pub async fn health_check(State(ctx): State<Arc<ClusterContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        node_id: ctx.self_id().to_string(),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store: bool,
    replay_backend: &'static str,
}

/// Readiness check (is the durable store reachable?)
pub async fn ready_check(
    State(ctx): State<Arc<ClusterContext>>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if let Err(e) = ctx.store().ping().await {
        tracing::warn!(error = %e, "Readiness check failed");
        // Return 503 if not ready
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(ReadyResponse {
        status: "ready",
        store: true,
        replay_backend: ctx.replay().backend_name().await,
    }))
}
