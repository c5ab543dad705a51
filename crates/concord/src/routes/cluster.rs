//! Cluster state views: membership, mastership, and properties.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use concord_common::constants::NODE_DELETE_SAFETY_MS;
use concord_common::{MasterState, NodeRecord, PropertyEntry, now_millis};

use super::error_status;
use crate::context::ClusterContext;

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[derive(Serialize)]
pub struct NodeView {
    node_id: String,
    name: String,
    address: String,
    cluster_port: u16,
    boot_time: DateTime<Utc>,
    last_update: DateTime<Utc>,
    avg_load: f64,
    root_credential: bool,
    /// Old enough to be removed
    stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    multicast_address: Option<String>,
}

impl NodeView {
    fn from_record(record: NodeRecord, now: i64) -> Self {
        Self {
            stale: record.idle_millis(now) > NODE_DELETE_SAFETY_MS,
            boot_time: timestamp(record.boot_time),
            last_update: timestamp(record.last_update),
            node_id: record.node_id,
            name: record.name,
            address: record.address,
            cluster_port: record.cluster_port,
            avg_load: record.avg_load,
            root_credential: record.is_master,
            multicast_address: record.multicast_address,
        }
    }
}

pub async fn list_nodes(
    State(ctx): State<Arc<ClusterContext>>,
) -> Result<Json<Vec<NodeView>>, StatusCode> {
    let mut nodes = ctx.registry().list_all().await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to list nodes");
        error_status(&e)
    })?;
    nodes.sort_by(|a, b| a.name.cmp(&b.name));

    let now = now_millis();
    Ok(Json(
        nodes
            .into_iter()
            .map(|n| NodeView::from_record(n, now))
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct MasterView {
    master_node_id: String,
    touched_time: DateTime<Utc>,
    version: i64,
    /// This node's local view
    node_id: String,
    state: MasterState,
    #[serde(skip_serializing_if = "Option::is_none")]
    fencing_token: Option<i64>,
}

pub async fn master(
    State(ctx): State<Arc<ClusterContext>>,
) -> Result<Json<MasterView>, StatusCode> {
    let row = ctx.store().read_master().await.map_err(|e| {
        tracing::warn!(error = %e, "Failed to read master row");
        error_status(&e)
    })?;
    let elector = ctx.elector();

    Ok(Json(MasterView {
        master_node_id: row.master_node_id,
        touched_time: timestamp(row.touched_time),
        version: row.version,
        node_id: ctx.self_id().to_string(),
        state: elector.state(),
        fencing_token: elector.fencing_token(),
    }))
}

#[derive(Serialize)]
pub struct MembersView {
    backend: &'static str,
    members: Vec<String>,
}

/// Nodes sharing the replay backend
pub async fn replay_members(State(ctx): State<Arc<ClusterContext>>) -> Json<MembersView> {
    let replay = ctx.replay();
    Json(MembersView {
        backend: replay.backend_name().await,
        members: replay.member_addresses().await,
    })
}

pub async fn get_property(
    State(ctx): State<Arc<ClusterContext>>,
    Path(name): Path<String>,
) -> Result<Json<PropertyEntry>, StatusCode> {
    match ctx.properties().get(&name).await {
        Some(entry) => Ok(Json(entry.as_ref().clone())),
        None => Err(StatusCode::NOT_FOUND),
    }
}
