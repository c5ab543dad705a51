//! Cluster-wide replay protection.
//!
//! `ReplayCache` rejects message ids already seen anywhere in the cluster
//! until their validity window passes. The fast path is a pluggable
//! [`DistributedMap`]; the durable store holds flushed ids so a backend that
//! lost its state can be refilled instead of forgetting prior replays.

mod group;
mod local;
mod map;
mod redis_map;

pub use group::GroupMap;
pub use local::LocalMap;
pub use map::{DistributedMap, ExpiredBefore, ReplayValue};
pub use redis_map::RedisMap;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use concord_common::constants::BACKEND_RESTART_BACKOFF_SECS;
use concord_common::{ClusterError, ReplayBackendKind, ReplayEntry, Result, now_millis};

use crate::cluster::GroupConfig;
use crate::store::ClusterStore;

/// Replay-protection cache over a distributed map and the durable store
pub struct ReplayCache {
    /// Readers run normal operations; a restart takes the write side
    map: RwLock<Box<dyn DistributedMap>>,
    store: Arc<dyn ClusterStore>,
    op_timeout: Duration,
    restart_backoff: Duration,
    last_restart: Mutex<Option<Instant>>,
}

impl ReplayCache {
    pub fn new(
        map: Box<dyn DistributedMap>,
        store: Arc<dyn ClusterStore>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            map: RwLock::new(map),
            store,
            op_timeout,
            restart_backoff: Duration::from_secs(BACKEND_RESTART_BACKOFF_SECS),
            last_restart: Mutex::new(None),
        }
    }

    /// Override the minimum gap between backend restarts
    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub async fn backend_name(&self) -> &'static str {
        self.map.read().await.name()
    }

    /// Fill an empty backend from the durable store
    pub async fn populate(&self) -> Result<usize> {
        let map = self.map.read().await;
        self.populate_into(&**map, now_millis()).await
    }

    async fn populate_into(&self, map: &dyn DistributedMap, now: i64) -> Result<usize> {
        if !self.bounded(map.is_empty()).await? {
            return Ok(0);
        }

        let entries = self.store.replay_ids_valid_at(now).await?;
        let mut inserted = 0;
        for entry in &entries {
            let ttl = Duration::from_millis((entry.expires - now).max(0) as u64);
            let value = ReplayValue::flushed(entry.expires);
            let put = map.put_if_absent_or_expired(&entry.message_id, value, ttl, ExpiredBefore(now));
            if self.bounded(put).await? {
                inserted += 1;
            }
        }

        tracing::info!(
            backend = map.name(),
            restored = inserted,
            "Replay cache populated from store"
        );
        Ok(inserted)
    }

    /// Fail with `Duplicate` if `id` was asserted before and has not expired
    pub async fn assert_unique(&self, id: &str, not_valid_after: i64) -> Result<()> {
        self.assert_unique_at(id, not_valid_after, now_millis()).await
    }

    pub async fn assert_unique_at(&self, id: &str, not_valid_after: i64, now: i64) -> Result<()> {
        let ttl = not_valid_after - now;
        if ttl <= 0 {
            // Already expired: nothing to protect
            return Ok(());
        }

        let map = self.map.read().await;
        let outcome = self
            .bounded(map.put_if_absent_or_expired(
                id,
                ReplayValue::pending(not_valid_after),
                Duration::from_millis(ttl as u64),
                ExpiredBefore(now),
            ))
            .await;

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClusterError::Duplicate(id.to_string())),
            Err(e) if map.is_transient_error(&e) => {
                drop(map);
                tracing::warn!(backend_error = %e, "Replay backend timed out");
                self.recover().await;
                Err(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "Replay uniqueness check failed");
                Err(ClusterError::CheckFailed(e.to_string()))
            }
        }
    }

    /// Restart the backend and refill it, at most once per backoff window
    pub async fn recover(&self) {
        {
            let Ok(mut last) = self.last_restart.lock() else {
                return;
            };
            if last.is_some_and(|at| at.elapsed() < self.restart_backoff) {
                tracing::debug!("Replay backend restart skipped, attempted recently");
                return;
            }
            *last = Some(Instant::now());
        }

        let mut map = self.map.write().await;
        tracing::warn!(backend = map.name(), "Restarting replay backend");
        if let Err(e) = map.restart().await {
            tracing::error!(error = %e, "Replay backend restart failed");
            return;
        }
        if let Err(e) = self.populate_into(&**map, now_millis()).await {
            tracing::error!(error = %e, "Replay cache repopulation failed");
        }
    }

    /// Persist unflushed ids and mark them flushed.
    ///
    /// An entry re-claimed while the store write was in flight keeps its new
    /// value and is picked up by the next flush. Returns how many entries were
    /// marked flushed.
    pub async fn flush(&self) -> Result<usize> {
        let map = self.map.read().await;
        let keys = self.bounded(map.get_all_keys()).await?;

        let mut pending = Vec::new();
        for key in keys {
            match self.bounded(map.get(&key)).await? {
                Some(value) if !value.flushed => pending.push(ReplayEntry {
                    message_id: key,
                    expires: value.expiry,
                }),
                _ => {}
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let inserted = self.store.insert_replay_ids(&pending).await?;
        let mut marked = 0;
        for entry in &pending {
            let replace = map.replace(
                &entry.message_id,
                ReplayValue::pending(entry.expires),
                ReplayValue::flushed(entry.expires),
            );
            if self.bounded(replace).await? {
                marked += 1;
            } else {
                tracing::debug!(id = %entry.message_id, "Replay entry changed during flush");
            }
        }

        tracing::debug!(
            flushed = marked,
            inserted = inserted,
            "Replay ids flushed to store"
        );
        Ok(marked)
    }

    /// Sweep expired ids from the store and the backend
    pub async fn gc(&self) -> Result<u64> {
        self.gc_at(now_millis()).await
    }

    pub async fn gc_at(&self, now: i64) -> Result<u64> {
        let deleted = self.store.delete_expired_replay_ids(now).await?;
        let evicted = {
            let map = self.map.read().await;
            self.bounded(map.evict_expired(now)).await?
        };
        if deleted > 0 || evicted > 0 {
            tracing::debug!(deleted, evicted, "Expired replay ids removed");
        }
        Ok(deleted)
    }

    /// Nodes sharing the backend, for backends that track membership
    pub async fn member_addresses(&self) -> Vec<String> {
        self.map.read().await.member_addresses().await
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::BackendTimeout(format!(
                "no answer within {:?}",
                self.op_timeout
            ))),
        }
    }
}

/// Open the replay backend selected by configuration.
///
/// The group backend settles first claims through `store`.
pub async fn open_backend(
    kind: ReplayBackendKind,
    node_id: &str,
    redis_url: &str,
    group: Option<GroupConfig>,
    store: Arc<dyn ClusterStore>,
) -> anyhow::Result<Box<dyn DistributedMap>> {
    match kind {
        ReplayBackendKind::Local => Ok(Box::new(LocalMap::new(node_id))),
        ReplayBackendKind::Coordination => Ok(Box::new(RedisMap::connect(redis_url).await?)),
        ReplayBackendKind::Group => {
            let config = group.ok_or_else(|| {
                anyhow::anyhow!("group replay backend needs a multicast group address")
            })?;
            Ok(Box::new(GroupMap::join(config, store).await?))
        }
    }
}
