//! Replay map replicated over a multicast group.
//!
//! Every node keeps a full replica and answers repeats from it without a
//! round trip. A first sighting is settled by an atomic claim in the shared
//! store, so two nodes racing on one id within a propagation delay still
//! produce a single winner. Winning entries are written to the replica as
//! already flushed and broadcast; entries received from peers are applied as
//! they arrive.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use concord_common::{ReplayEntry, Result};

use super::map::{DistributedMap, ExpiredBefore, ReplayValue};
use crate::cluster::{GroupChannel, GroupConfig};
use crate::store::ClusterStore;

type Replica = Arc<RwLock<HashMap<String, ReplayValue>>>;

/// Group-communication [`DistributedMap`]
pub struct GroupMap {
    config: GroupConfig,
    store: Arc<dyn ClusterStore>,
    replica: Replica,
    channel: Option<GroupChannel>,
    applier: Option<JoinHandle<()>>,
}

impl GroupMap {
    pub async fn join(config: GroupConfig, store: Arc<dyn ClusterStore>) -> Result<Self> {
        let mut map = Self::detached(config, store);
        map.connect().await?;
        Ok(map)
    }

    /// A replica that has not joined the group yet
    fn detached(config: GroupConfig, store: Arc<dyn ClusterStore>) -> Self {
        Self {
            config,
            store,
            replica: Arc::new(RwLock::new(HashMap::new())),
            channel: None,
            applier: None,
        }
    }

    async fn connect(&mut self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = GroupChannel::join(self.config.clone(), tx).await?;
        self.applier = Some(tokio::spawn(apply_remote(self.replica.clone(), rx)));
        self.channel = Some(channel);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.leave().await;
        }
        if let Some(applier) = self.applier.take() {
            applier.abort();
        }
    }

    async fn publish(&self, key: &str, value: ReplayValue) {
        let Some(ref channel) = self.channel else {
            return;
        };
        if let Err(e) = channel.broadcast_put(key, &value.to_string()).await {
            tracing::warn!(key = %key, error = %e, "Failed to replicate replay entry");
        }
    }
}

/// Apply entries received from peers until the channel closes
async fn apply_remote(replica: Replica, mut rx: mpsc::UnboundedReceiver<(String, String)>) {
    while let Some((key, raw)) = rx.recv().await {
        match raw.parse::<ReplayValue>() {
            Ok(value) => {
                replica.write().await.insert(key, value);
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Dropping malformed replicated entry");
            }
        }
    }
}

#[async_trait]
impl DistributedMap for GroupMap {
    fn name(&self) -> &'static str {
        "group"
    }

    async fn get(&self, key: &str) -> Result<Option<ReplayValue>> {
        Ok(self.replica.read().await.get(key).copied())
    }

    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        value: ReplayValue,
        _ttl: Duration,
        expired: ExpiredBefore,
    ) -> Result<bool> {
        let stored = {
            let mut replica = self.replica.write().await;
            if replica.get(key).is_some_and(|current| !expired.matches(current)) {
                return Ok(false);
            }

            // Flushed values come from the store already; only new ids are claimed
            if !value.flushed {
                let entry = ReplayEntry {
                    message_id: key.to_string(),
                    expires: value.expiry,
                };
                if !self.store.claim_replay_id(&entry, expired.0).await? {
                    return Ok(false);
                }
            }
            let stored = ReplayValue::flushed(value.expiry);
            replica.insert(key.to_string(), stored);
            stored
        };
        self.publish(key, stored).await;
        Ok(true)
    }

    async fn replace(&self, key: &str, expected: ReplayValue, value: ReplayValue) -> Result<bool> {
        let replaced = match self.replica.write().await.get_mut(key) {
            Some(current) if *current == expected => {
                *current = value;
                true
            }
            _ => false,
        };
        if replaced {
            self.publish(key, value).await;
        }
        Ok(replaced)
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        Ok(self.replica.read().await.keys().cloned().collect())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.replica.read().await.is_empty())
    }

    async fn restart(&mut self) -> Result<()> {
        self.disconnect().await;
        // A rejoined sole member starts from nothing; population refills it
        self.replica.write().await.clear();
        self.connect().await?;
        tracing::info!(group = %self.config.group, "Rejoined multicast group");
        Ok(())
    }

    async fn evict_expired(&self, now: i64) -> Result<u64> {
        let mut replica = self.replica.write().await;
        let before = replica.len();
        replica.retain(|_, v| !v.is_expired(now));
        Ok((before - replica.len()) as u64)
    }

    async fn member_addresses(&self) -> Vec<String> {
        match self.channel {
            Some(ref channel) => channel.member_addresses().await,
            None => Vec::new(),
        }
    }
}
