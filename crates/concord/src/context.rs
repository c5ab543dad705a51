//! Coordination-layer context and lifecycle.

use anyhow::{Context, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use concord_common::ReplayBackendKind;

use crate::cluster::{ClusterRegistry, GroupConfig, MasterElector, NodeIdentity, read_load_average};
use crate::config::AppConfig;
use crate::properties::{DistributedLock, InvalidationBus, PropertyCache};
use crate::replay::{self, DistributedMap, LocalMap, ReplayCache};
use crate::scheduler::Scheduler;
use crate::store::{self, ClusterStore};

/// Scheduled job names
pub mod jobs {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ELECTION: &str = "election";
    pub const REPLAY_FLUSH: &str = "replay-flush";
    pub const REPLAY_GC: &str = "replay-gc";
}

/// Everything one node needs to take part in the cluster
pub struct ClusterContext {
    config: AppConfig,
    store: Arc<dyn ClusterStore>,
    identity: Arc<NodeIdentity>,
    registry: Arc<ClusterRegistry>,
    elector: Arc<MasterElector>,
    replay: Arc<ReplayCache>,
    properties: Arc<PropertyCache>,
    scheduler: Scheduler,
}

impl ClusterContext {
    /// Open the configured store and boot
    pub async fn new(config: AppConfig) -> Result<Self> {
        let store = store::open(&config.store).await?;
        Self::with_store(config, store).await
    }

    /// Boot against an existing store: register this node, load properties,
    /// and bring up the replay cache. Jobs start with [`Self::start`].
    pub async fn with_store(config: AppConfig, store: Arc<dyn ClusterStore>) -> Result<Self> {
        let identity = Arc::new(NodeIdentity::new(config.cluster.clone()));
        let registry = Arc::new(ClusterRegistry::new(
            store.clone(),
            identity.clone(),
            config.cluster.root_key_path.clone(),
        ));

        let record = registry
            .self_record()
            .await
            .context("Failed to register node")?;
        tracing::info!(
            node_id = %record.node_id,
            name = %record.name,
            address = %record.address,
            "Node registered"
        );

        let elector = Arc::new(MasterElector::new(
            store.clone(),
            identity.clone(),
            config.election.clone(),
        ));

        let properties = Arc::new(
            PropertyCache::load(store.clone(), InvalidationBus::new())
                .await
                .context("Failed to load cluster properties")?,
        );

        let map = open_replay_backend(&config, &registry, &identity, store.clone()).await?;
        let replay = Arc::new(ReplayCache::new(
            map,
            store.clone(),
            Duration::from_millis(config.replay.op_timeout_ms),
        ));
        if let Err(e) = replay.populate().await {
            // The next restart or timeout recovery repopulates
            tracing::warn!(error = %e, "Initial replay cache population failed");
        }

        Ok(Self {
            config,
            store,
            identity,
            registry,
            elector,
            replay,
            properties,
            scheduler: Scheduler::new(),
        })
    }

    /// Register the periodic jobs and the invalidation worker
    pub fn start(&self) {
        let registry = self.registry.clone();
        self.scheduler.schedule(
            jobs::HEARTBEAT,
            Duration::from_secs(self.config.cluster.heartbeat_interval_secs),
            move || {
                let registry = registry.clone();
                async move {
                    let load = read_load_average().await;
                    registry.heartbeat(load).await?;
                    Ok(())
                }
            },
        );

        let elector = self.elector.clone();
        self.scheduler.schedule(
            jobs::ELECTION,
            self.config.election.check_interval(),
            move || {
                let elector = elector.clone();
                async move {
                    elector.tick().await?;
                    Ok(())
                }
            },
        );

        let replay = self.replay.clone();
        self.scheduler.schedule(
            jobs::REPLAY_FLUSH,
            Duration::from_secs(self.config.replay.flush_interval_secs),
            move || {
                let replay = replay.clone();
                async move {
                    replay.flush().await?;
                    Ok(())
                }
            },
        );

        let replay = self.replay.clone();
        self.scheduler.schedule(
            jobs::REPLAY_GC,
            Duration::from_secs(self.config.replay.gc_interval_secs),
            move || {
                let replay = replay.clone();
                async move {
                    replay.gc().await?;
                    Ok(())
                }
            },
        );

        let events = self.properties.bus().subscribe();
        tokio::spawn(
            self.properties
                .clone()
                .run_invalidation_worker(events, self.scheduler.shutdown_signal()),
        );
        tokio::spawn(
            self.properties
                .clone()
                .run_remote_invalidations(self.scheduler.shutdown_signal()),
        );

        tracing::info!(
            node_id = %self.identity.self_id(),
            jobs = ?self.scheduler.job_names(),
            "Cluster coordination started"
        );
    }

    /// Stop all jobs, then flush pending replay ids
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        match self.replay.flush().await {
            Ok(flushed) => tracing::info!(flushed, "Replay cache flushed on shutdown"),
            Err(e) => tracing::error!(error = %e, "Replay cache flush on shutdown failed"),
        }
    }

    /// Non-blocking lock stored in the property `name`
    pub fn lock(&self, name: &str) -> DistributedLock {
        DistributedLock::new(
            self.properties.clone(),
            name,
            self.identity.self_id(),
            self.config.lock.staleness_timeout(),
        )
    }

    pub fn self_id(&self) -> &str {
        self.identity.self_id()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ClusterStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn elector(&self) -> &Arc<MasterElector> {
        &self.elector
    }

    pub fn replay(&self) -> &Arc<ReplayCache> {
        &self.replay
    }

    pub fn properties(&self) -> &Arc<PropertyCache> {
        &self.properties
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

/// Open the configured replay backend.
///
/// A group backend that cannot derive its address or join the group falls
/// back to the local map rather than failing the whole node.
async fn open_replay_backend(
    config: &AppConfig,
    registry: &ClusterRegistry,
    identity: &NodeIdentity,
    store: Arc<dyn ClusterStore>,
) -> Result<Box<dyn DistributedMap>> {
    let kind = config.effective_replay_backend();
    let self_id = identity.self_id();
    let redis_url = &config.store.redis_url;

    if kind != ReplayBackendKind::Group {
        let map = replay::open_backend(kind, self_id, redis_url, None, store)
            .await
            .context("Failed to open replay backend")?;
        tracing::info!(backend = map.name(), "Replay backend ready");
        return Ok(map);
    }

    let opened = match group_config(config, registry, identity).await {
        Ok(group) => replay::open_backend(kind, self_id, redis_url, Some(group), store).await,
        Err(e) => Err(e),
    };
    match opened {
        Ok(map) => {
            tracing::info!(backend = map.name(), "Replay backend ready");
            Ok(map)
        }
        Err(e) => {
            tracing::error!(
                error = %format!("{e:#}"),
                "Group replay backend unavailable, using local replay cache"
            );
            Ok(Box::new(LocalMap::new(self_id)))
        }
    }
}

async fn group_config(
    config: &AppConfig,
    registry: &ClusterRegistry,
    identity: &NodeIdentity,
) -> Result<GroupConfig> {
    let multicast = &config.replay.multicast;
    let address = registry
        .resolve_multicast_address(multicast.address.as_deref(), multicast.legacy_ipv4)
        .await?;
    let group: IpAddr = address
        .parse()
        .with_context(|| format!("Invalid multicast group address {address}"))?;
    Ok(GroupConfig::new(
        identity.self_id().to_string(),
        group,
        multicast.port,
        identity.observable_address(),
    ))
}
