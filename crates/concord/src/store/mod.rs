//! Durable cluster store.
//!
//! Holds the four shared tables the coordination layer relies on: node rows,
//! the master election singleton, persisted replay ids, and cluster
//! properties. Every shared mutation that can race (master row, property
//! rows) is a version-checked conditional write; nothing blind-writes them.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use concord_common::{
    EntityId, Invalidation, MasterElectionRecord, NodeRecord, PropertyEntry, ReplayEntry, Result,
    StoreBackendKind,
};

use crate::config::StoreConfig;

/// Backend-agnostic access to the shared durable store
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Check the store is reachable
    async fn ping(&self) -> Result<()>;

    // === Nodes ===

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    /// Insert a new node row; fails with `StaleConflict` if the id is taken
    async fn insert_node(&self, record: &NodeRecord) -> Result<()>;

    /// Overwrite an existing node row; fails with `NotFound` if absent
    async fn update_node(&self, record: &NodeRecord) -> Result<()>;

    /// Delete a node row and its usage data. Returns false if it did not exist.
    async fn delete_node(&self, node_id: &str) -> Result<bool>;

    /// Add to a node's per-service usage counter
    async fn record_usage(&self, node_id: &str, service: &str, requests: u64) -> Result<()>;

    /// Per-service usage counters owned by a node
    async fn node_usage(&self, node_id: &str) -> Result<Vec<(String, u64)>>;

    // === Master election ===

    /// Read the singleton row (all-default when never written)
    async fn read_master(&self) -> Result<MasterElectionRecord>;

    /// Set `master_node_id`/`touched_time` and bump the version iff the stored
    /// version equals `expected_version`. Returns whether the write happened.
    async fn cas_master(&self, expected_version: i64, node_id: &str, touched_time: i64)
    -> Result<bool>;

    // === Replay ids ===

    /// Insert ids. An id already present keeps the later of the two expiries.
    /// Returns how many were new.
    async fn insert_replay_ids(&self, entries: &[ReplayEntry]) -> Result<usize>;

    /// Atomically record `entry` unless a row for the id is still valid at
    /// `now`. Returns whether this call wrote it.
    async fn claim_replay_id(&self, entry: &ReplayEntry, now: i64) -> Result<bool>;

    /// Ids with `expires >= now`
    async fn replay_ids_valid_at(&self, now: i64) -> Result<Vec<ReplayEntry>>;

    /// Delete ids with `expires < now`. Returns how many were removed.
    async fn delete_expired_replay_ids(&self, now: i64) -> Result<u64>;

    // === Properties ===

    async fn get_property(&self, name: &str) -> Result<Option<PropertyEntry>>;

    async fn get_property_by_id(&self, id: EntityId) -> Result<Option<PropertyEntry>>;

    async fn list_properties(&self) -> Result<Vec<PropertyEntry>>;

    /// Create (`expected_version == None`, must be absent) or update (stored
    /// version must equal `expected_version`) a property. A mismatch is
    /// `StaleConflict`.
    async fn save_property(
        &self,
        name: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> Result<PropertyEntry>;

    /// Delete a property, optionally checking its version first. Returns the
    /// removed row, or `None` if it did not exist.
    async fn delete_property(
        &self,
        name: &str,
        expected_version: Option<i64>,
    ) -> Result<Option<PropertyEntry>>;

    // === Invalidations ===

    /// Announce changed property ids to every subscriber of this store
    async fn publish_invalidation(&self, invalidation: &Invalidation) -> Result<()>;

    /// Invalidations published by any node from now on, including this one.
    /// The stream ends when the underlying subscription is lost.
    async fn subscribe_invalidations(&self) -> Result<BoxStream<'static, Invalidation>>;
}

/// Open the store selected by configuration
pub async fn open(config: &StoreConfig) -> anyhow::Result<Arc<dyn ClusterStore>> {
    match config.backend {
        StoreBackendKind::Memory => {
            tracing::warn!("Using process-local store; cluster state is not shared");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackendKind::Redis => {
            let store = RedisStore::connect(&config.redis_url).await?;
            Ok(Arc::new(store))
        }
    }
}
