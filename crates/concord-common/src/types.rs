//! Core types shared across Concord components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClusterError;

/// Current wall-clock time in Unix epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One registered gateway node.
///
/// Only the owning node writes its row; peers read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Stable node identifier
    pub node_id: String,

    /// Address peers use to reach this node
    pub address: String,

    /// Cluster communication port
    pub cluster_port: u16,

    /// Human-readable name (SSG1, SSG2, ...)
    pub name: String,

    /// Process start time (epoch millis)
    pub boot_time: i64,

    /// Last heartbeat (epoch millis)
    pub last_update: i64,

    /// Load average reported at the last heartbeat
    pub avg_load: f64,

    /// Advisory flag: node holds the root signing credential
    pub is_master: bool,

    /// Group-communication rendezvous address, once derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multicast_address: Option<String>,

    /// Hardware fingerprint the node id was derived from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_identifier: Option<String>,
}

impl NodeRecord {
    /// Milliseconds since the row was last touched
    pub fn idle_millis(&self, now: i64) -> i64 {
        now - self.last_update
    }
}

/// Singleton row naming the current master.
///
/// Mutated only through a compare-and-swap on `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterElectionRecord {
    /// Node currently holding mastership (empty when unclaimed)
    pub master_node_id: String,

    /// Last time the master refreshed the row (epoch millis)
    pub touched_time: i64,

    /// Monotonic row version
    pub version: i64,
}

/// Local election state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterState {
    Master,
    Follower,
}

impl Default for MasterState {
    fn default() -> Self {
        Self::Follower
    }
}

/// A persisted replay id row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Opaque message or token id
    pub message_id: String,

    /// Absolute expiry (epoch millis)
    pub expires: i64,
}

/// Identifier published on the invalidation bus
pub type EntityId = u64;

/// Changed property ids announced to every node sharing the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// Cache instance that made the change
    pub origin: String,

    pub ids: Vec<EntityId>,
}

/// Immutable snapshot of one cluster property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyEntry {
    /// Stable object id
    pub id: EntityId,

    /// Property name (unique)
    pub name: String,

    /// Property value
    pub value: String,

    /// Optimistic-concurrency version
    pub version: i64,
}

/// Lock state encoded as `<locked>:<timestamp>:<owner_id>` in a property value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub locked: bool,
    /// Acquisition or release time (epoch millis)
    pub timestamp: i64,
    pub owner_id: String,
}

impl LockEntry {
    pub fn new(locked: bool, timestamp: i64, owner_id: impl Into<String>) -> Self {
        Self {
            locked,
            timestamp,
            owner_id: owner_id.into(),
        }
    }

    /// Age of the entry relative to `now`
    pub fn age_millis(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

impl fmt::Display for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.locked, self.timestamp, self.owner_id)
    }
}

impl FromStr for LockEntry {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(locked), Some(timestamp), Some(owner_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(ClusterError::InvalidInput(format!("malformed lock entry: {s}")));
        };

        let locked = locked
            .parse::<bool>()
            .map_err(|_| ClusterError::InvalidInput(format!("bad lock flag: {locked}")))?;
        let timestamp = timestamp
            .parse::<i64>()
            .map_err(|_| ClusterError::InvalidInput(format!("bad lock timestamp: {timestamp}")))?;

        Ok(Self {
            locked,
            timestamp,
            owner_id: owner_id.to_string(),
        })
    }
}

/// Durable store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// Process-local tables (single node, tests)
    Memory,
    /// Shared Redis instance
    Redis,
}

impl Default for StoreBackendKind {
    fn default() -> Self {
        Self::Redis
    }
}

/// Replay cache backend strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayBackendKind {
    /// Replicated map over a multicast group
    Group,
    /// Map held by the coordination service (Redis)
    Coordination,
    /// Single-node map, keys prefixed by the node id
    Local,
}

impl Default for ReplayBackendKind {
    fn default() -> Self {
        Self::Coordination
    }
}
