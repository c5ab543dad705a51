//! Read-only HTTP status surface for Concord.

use axum::{Router, http::StatusCode, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use concord_common::ClusterError;

use crate::context::ClusterContext;

mod cluster;
mod health;

/// Upper bound on one status request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the status router
pub fn create_router(ctx: Arc<ClusterContext>) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))

        // Cluster views
        .route("/cluster/nodes", get(cluster::list_nodes))
        .route("/cluster/master", get(cluster::master))
        .route("/cluster/members", get(cluster::replay_members))
        .route("/cluster/properties/{name}", get(cluster::get_property))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(ctx)
}

/// HTTP status for a coordination error
fn error_status(err: &ClusterError) -> StatusCode {
    StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
