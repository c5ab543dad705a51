//! Cluster membership: this node's row, heartbeats, and administrative removal.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use concord_common::constants::{
    NODE_DELETE_SAFETY_MS, NODE_NAME_FALLBACK, NODE_NAME_POOL_SIZE, NODE_NAME_PREFIX,
};
use concord_common::{ClusterError, NodeRecord, Result, now_millis};

use super::identity::NodeIdentity;
use super::multicast;
use crate::store::ClusterStore;

/// Registry of cluster nodes backed by the durable store
pub struct ClusterRegistry {
    store: Arc<dyn ClusterStore>,
    identity: Arc<NodeIdentity>,
    /// ed25519 root signing key location
    root_key_path: Option<std::path::PathBuf>,
    /// When this process started (epoch millis)
    boot_time: i64,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        identity: Arc<NodeIdentity>,
        root_key_path: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            store,
            identity,
            root_key_path,
            boot_time: now_millis(),
        }
    }

    pub fn self_id(&self) -> &str {
        self.identity.self_id()
    }

    /// Load this node's row, creating it on first boot.
    ///
    /// An existing row whose address, port, or boot time no longer matches
    /// this process is corrected in place.
    pub async fn self_record(&self) -> Result<NodeRecord> {
        let node_id = self.identity.self_id();
        let address = self.identity.observable_address();
        let port = self.identity.cluster_port();

        if let Some(mut record) = self.store.get_node(node_id).await? {
            if record.address != address
                || record.cluster_port != port
                || record.boot_time != self.boot_time
            {
                tracing::info!(
                    node_id = %node_id,
                    old_address = %record.address,
                    new_address = %address,
                    "Correcting node record"
                );
                record.address = address;
                record.cluster_port = port;
                record.boot_time = self.boot_time;
                self.store.update_node(&record).await?;
            }
            return Ok(record);
        }

        let existing = self.store.list_nodes().await?;
        let now = now_millis();
        let record = NodeRecord {
            node_id: node_id.to_string(),
            address,
            cluster_port: port,
            name: allocate_name(&existing),
            boot_time: self.boot_time,
            last_update: now,
            avg_load: 0.0,
            is_master: has_root_credential(self.root_key_path.as_deref()),
            multicast_address: None,
            mac_identifier: self.identity.mac_identifier().map(str::to_string),
        };

        match self.store.insert_node(&record).await {
            Ok(()) => {
                tracing::info!(node_id = %record.node_id, name = %record.name, "Registered new cluster node");
                Ok(record)
            }
            // Another process with the same id registered first
            Err(ClusterError::StaleConflict(_)) => self
                .store
                .get_node(node_id)
                .await?
                .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}"))),
            Err(e) => Err(e),
        }
    }

    /// Refresh load, last-update time, and the advisory master flag
    pub async fn heartbeat(&self, load: f64) -> Result<NodeRecord> {
        let mut record = match self.store.get_node(self.identity.self_id()).await? {
            Some(record) => record,
            None => self.self_record().await?,
        };

        record.avg_load = load;
        record.last_update = now_millis();
        record.is_master = has_root_credential(self.root_key_path.as_deref());
        self.store.update_node(&record).await?;

        tracing::trace!(node_id = %record.node_id, load = load, "Heartbeat");
        Ok(record)
    }

    /// Full membership snapshot
    pub async fn list_all(&self) -> Result<Vec<NodeRecord>> {
        self.store.list_nodes().await
    }

    /// True when more than one node is registered
    pub async fn is_cluster(&self) -> Result<bool> {
        Ok(self.store.list_nodes().await?.len() > 1)
    }

    /// This node's human-readable name
    pub async fn self_name(&self) -> Result<String> {
        Ok(self.self_record().await?.name)
    }

    /// Remove a node that has stopped reporting
    pub async fn remove(&self, node_id: &str) -> Result<()> {
        self.remove_at(node_id, now_millis()).await
    }

    /// Remove a node, judging staleness against an explicit clock
    pub async fn remove_at(&self, node_id: &str, now: i64) -> Result<()> {
        let record = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;

        let idle_ms = record.idle_millis(now);
        if idle_ms <= NODE_DELETE_SAFETY_MS {
            return Err(ClusterError::NotStale {
                node_id: node_id.to_string(),
                idle_ms,
            });
        }

        self.store.delete_node(node_id).await?;
        tracing::info!(node_id = %node_id, name = %record.name, idle_ms = idle_ms, "Removed stale node");
        Ok(())
    }

    /// Administrative rename
    pub async fn rename(&self, node_id: &str, new_name: &str) -> Result<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ClusterError::InvalidInput("node name must not be empty".to_string()));
        }

        let mut record = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("node {node_id}")))?;
        record.name = new_name.to_string();
        self.store.update_node(&record).await
    }

    /// Pick the group-communication rendezvous address.
    ///
    /// A configured address wins, then one already published by any node,
    /// and only then a freshly derived one, which is recorded on this node's
    /// row so peers converge on it.
    pub async fn resolve_multicast_address(
        &self,
        configured: Option<&str>,
        legacy_ipv4: bool,
    ) -> Result<String> {
        if let Some(address) = configured {
            if multicast::is_group_address(address) {
                return Ok(address.to_string());
            }
            tracing::warn!(address = %address, "Configured multicast address is not a group address; ignoring");
        }

        let nodes = self.store.list_nodes().await?;
        let mut published: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| {
                n.multicast_address
                    .as_deref()
                    .is_some_and(multicast::is_group_address)
            })
            .collect();
        published.sort_by_key(|n| n.boot_time);
        if let Some(address) = published.first().and_then(|n| n.multicast_address.clone()) {
            return Ok(address);
        }

        let mut record = self.self_record().await?;
        let self_address: IpAddr = record
            .address
            .parse()
            .map_err(|_| ClusterError::Derivation(format!("unparseable address {}", record.address)))?;
        let derived = multicast::derive_multicast_address(self_address, legacy_ipv4)?;

        record.multicast_address = Some(derived.clone());
        self.store.update_node(&record).await?;
        tracing::info!(address = %derived, "Derived multicast group address");
        Ok(derived)
    }
}

/// First unused name from the numbered pool
fn allocate_name(existing: &[NodeRecord]) -> String {
    let taken: HashSet<&str> = existing.iter().map(|n| n.name.as_str()).collect();
    (1..=NODE_NAME_POOL_SIZE)
        .map(|i| format!("{NODE_NAME_PREFIX}{i}"))
        .find(|name| !taken.contains(name.as_str()))
        .unwrap_or_else(|| NODE_NAME_FALLBACK.to_string())
}

/// Whether a usable ed25519 root signing key is present
fn has_root_credential(path: Option<&Path>) -> bool {
    let Some(path) = path else {
        return false;
    };
    match std::fs::read(path) {
        Ok(bytes) => match <[u8; 32]>::try_from(bytes.as_slice()) {
            Ok(secret) => {
                let signing = ed25519_dalek::SigningKey::from_bytes(&secret);
                tracing::trace!(public = ?signing.verifying_key().as_bytes(), "Root credential present");
                true
            }
            Err(_) => {
                tracing::warn!(path = ?path, "Invalid root key length (expected 32 bytes)");
                false
            }
        },
        Err(_) => false,
    }
}

/// One-minute load average, or 0.0 where unavailable
pub async fn read_load_average() -> f64 {
    tokio::fs::read_to_string("/proc/loadavg")
        .await
        .ok()
        .and_then(|raw| raw.split_whitespace().next()?.parse().ok())
        .unwrap_or(0.0)
}
