//! Configuration management for Concord.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use concord_common::constants::{
    CLUSTER_HEARTBEAT_INTERVAL_SECS, DEFAULT_CLUSTER_PORT, DEFAULT_ID_FILE, DEFAULT_LISTEN_ADDR,
    DEFAULT_MASTER_CHECK_INTERVAL_SECS, DEFAULT_MASTER_STALENESS_SECS, DEFAULT_MULTICAST_PORT,
    DEFAULT_REDIS_URL, DEFAULT_REPLAY_FLUSH_INTERVAL_SECS, DEFAULT_REPLAY_GC_INTERVAL_SECS,
    DEFAULT_REPLAY_OP_TIMEOUT_MS,
};
use concord_common::{ReplayBackendKind, StoreBackendKind};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Admin status listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Durable store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Node identity and registration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Master election
    #[serde(default)]
    pub election: ElectionConfig,

    /// Replay protection cache
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Distributed lock
    #[serde(default)]
    pub lock: LockConfig,
}

/// Durable store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Which store implementation to use
    #[serde(default)]
    pub backend: StoreBackendKind,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            redis_url: default_redis_url(),
        }
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Enable cluster mode (disabled forces the local replay backend)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Explicit node id, bypassing hardware fingerprinting
    #[serde(default)]
    pub node_id: Option<String>,

    /// File holding a generated node id across restarts
    #[serde(default = "default_id_file")]
    pub id_file: PathBuf,

    /// Cluster/partition salt mixed into the hardware fingerprint
    #[serde(default = "default_salt")]
    pub salt: String,

    /// Address advertised to peers (auto-detected if not set)
    #[serde(default)]
    pub address: Option<String>,

    /// Cluster communication port
    #[serde(default = "default_cluster_port")]
    pub port: u16,

    /// ed25519 root signing key; holding it sets the advisory master flag
    #[serde(default)]
    pub root_key_path: Option<PathBuf>,

    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_id: None,
            id_file: default_id_file(),
            salt: default_salt(),
            address: None,
            port: default_cluster_port(),
            root_key_path: None,
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Master election configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionConfig {
    /// How often the election check runs
    #[serde(default = "default_master_check_interval")]
    pub check_interval_secs: u64,

    /// Master row age after which mastership may be taken over
    #[serde(default = "default_master_staleness")]
    pub staleness_timeout_secs: u64,

    /// Pin this node id as master regardless of the election
    #[serde(default)]
    pub master_override: Option<String>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_master_check_interval(),
            staleness_timeout_secs: default_master_staleness(),
            master_override: None,
        }
    }
}

impl ElectionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_secs(self.staleness_timeout_secs)
    }
}

/// Replay cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Backend strategy
    #[serde(default)]
    pub backend: ReplayBackendKind,

    /// Upper bound on a single backend operation in milliseconds
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,

    /// Flush-to-store interval in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Expired-id sweep interval in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    /// Group-communication backend settings
    #[serde(default)]
    pub multicast: MulticastConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            backend: ReplayBackendKind::default(),
            op_timeout_ms: default_op_timeout(),
            flush_interval_secs: default_flush_interval(),
            gc_interval_secs: default_gc_interval(),
            multicast: MulticastConfig::default(),
        }
    }
}

/// Multicast rendezvous settings
#[derive(Debug, Clone, Deserialize)]
pub struct MulticastConfig {
    /// Fixed group address (derived and shared through the registry if not set)
    #[serde(default)]
    pub address: Option<String>,

    /// UDP port of the group channel
    #[serde(default = "default_multicast_port")]
    pub port: u16,

    /// Use the older 224.0.7.x IPv4 scheme
    #[serde(default)]
    pub legacy_ipv4: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            address: None,
            port: default_multicast_port(),
            legacy_ipv4: false,
        }
    }
}

/// Distributed lock configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LockConfig {
    /// Age after which a held lock may be stolen (never, if not set)
    #[serde(default)]
    pub staleness_timeout_secs: Option<u64>,
}

impl LockConfig {
    pub fn staleness_timeout(&self) -> Option<Duration> {
        self.staleness_timeout_secs.map(Duration::from_secs)
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub redis_url: Option<String>,
    pub listen_addr: Option<String>,
    pub node_id: Option<String>,
    pub master_override: Option<String>,
}

// Default value functions
fn default_true() -> bool { true }
fn default_redis_url() -> String { DEFAULT_REDIS_URL.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_id_file() -> PathBuf { PathBuf::from(DEFAULT_ID_FILE) }
fn default_salt() -> String { "default".to_string() }
fn default_cluster_port() -> u16 { DEFAULT_CLUSTER_PORT }
fn default_heartbeat_interval() -> u64 { CLUSTER_HEARTBEAT_INTERVAL_SECS }
fn default_master_check_interval() -> u64 { DEFAULT_MASTER_CHECK_INTERVAL_SECS }
fn default_master_staleness() -> u64 { DEFAULT_MASTER_STALENESS_SECS }
fn default_op_timeout() -> u64 { DEFAULT_REPLAY_OP_TIMEOUT_MS }
fn default_flush_interval() -> u64 { DEFAULT_REPLAY_FLUSH_INTERVAL_SECS }
fn default_gc_interval() -> u64 { DEFAULT_REPLAY_GC_INTERVAL_SECS }
fn default_multicast_port() -> u16 { DEFAULT_MULTICAST_PORT }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: StoreConfig::default(),
            cluster: ClusterConfig::default(),
            election: ElectionConfig::default(),
            replay: ReplayConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and `CONCORD_*` environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &Overrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("CONCORD").separator("__"))
            .build()
            .context("Failed to load config file")?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref redis_url) = overrides.redis_url {
            config.store.redis_url = redis_url.clone();
        }
        if let Some(ref listen) = overrides.listen_addr {
            config.listen_addr = listen.clone();
        }
        if let Some(ref node_id) = overrides.node_id {
            config.cluster.node_id = Some(node_id.clone());
        }
        if let Some(ref master) = overrides.master_override {
            config.election.master_override = Some(master.clone());
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordination layer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.election.check_interval_secs == 0 {
            anyhow::bail!("election.check_interval_secs must be positive");
        }
        if self.election.staleness_timeout_secs <= self.election.check_interval_secs {
            anyhow::bail!("election.staleness_timeout_secs must exceed the check interval");
        }
        if self.cluster.heartbeat_interval_secs == 0 {
            anyhow::bail!("cluster.heartbeat_interval_secs must be positive");
        }
        Ok(())
    }

    /// Replay backend actually used: clustering disabled forces the local map
    pub fn effective_replay_backend(&self) -> ReplayBackendKind {
        if self.cluster.enabled {
            self.replay.backend
        } else {
            ReplayBackendKind::Local
        }
    }
}
