//! Shared constants for Concord components.

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default admin status listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";

/// Default cluster communication port recorded in the node row
pub const DEFAULT_CLUSTER_PORT: u16 = 2124;

/// Default local file holding a generated node id
pub const DEFAULT_ID_FILE: &str = "/var/lib/concord/node.id";

/// Cluster heartbeat interval (seconds)
pub const CLUSTER_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// A node row must be idle this long before it may be removed (milliseconds)
pub const NODE_DELETE_SAFETY_MS: i64 = 30_000;

/// Default master check interval (seconds)
pub const DEFAULT_MASTER_CHECK_INTERVAL_SECS: u64 = 10;

/// Default master staleness timeout (seconds)
pub const DEFAULT_MASTER_STALENESS_SECS: u64 = 40;

/// Minimum gap between two replay backend restarts (seconds)
pub const BACKEND_RESTART_BACKOFF_SECS: u64 = 60;

/// Default replay cache flush interval (seconds)
pub const DEFAULT_REPLAY_FLUSH_INTERVAL_SECS: u64 = 60;

/// Default replay id garbage collection interval (seconds)
pub const DEFAULT_REPLAY_GC_INTERVAL_SECS: u64 = 300;

/// Default bound on a single replay backend operation (milliseconds)
pub const DEFAULT_REPLAY_OP_TIMEOUT_MS: u64 = 5_000;

/// Default UDP port for the group-communication replay backend
pub const DEFAULT_MULTICAST_PORT: u16 = 8786;

/// Human-readable node names are allocated as `SSG1`, `SSG2`, ...
pub const NODE_NAME_PREFIX: &str = "SSG";

/// Size of the numbered node name pool
pub const NODE_NAME_POOL_SIZE: usize = 64;

/// Name used when the numbered pool is exhausted
pub const NODE_NAME_FALLBACK: &str = "no_name";

/// Redis key names
pub mod redis_keys {
    /// Node row: concord:node:{node_id}
    pub const NODE_PREFIX: &str = "concord:node:";

    /// Set of all registered node ids
    pub const NODE_INDEX: &str = "concord:nodes";

    /// Per-node usage data: concord:usage:{node_id}
    pub const USAGE_PREFIX: &str = "concord:usage:";

    /// Master election singleton row
    pub const MASTER: &str = "concord:master";

    /// Persisted replay ids (sorted set scored by expiry millis)
    pub const REPLAY_IDS: &str = "concord:replay_ids";

    /// Property row: concord:property:{name}
    pub const PROPERTY_PREFIX: &str = "concord:property:";

    /// Property id -> name index
    pub const PROPERTY_IDS: &str = "concord:property_ids";

    /// Property id sequence
    pub const PROPERTY_SEQ: &str = "concord:property_seq";

    /// Distributed replay map entry: concord:replay:{opaque_id}
    pub const REPLAY_MAP_PREFIX: &str = "concord:replay:";

    /// Distributed replay map key index
    pub const REPLAY_MAP_INDEX: &str = "concord:replay_keys";

    /// Pub/sub channel carrying property invalidations
    pub const PROPERTY_INVALIDATIONS: &str = "concord:property_invalidations";
}
