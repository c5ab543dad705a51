//! Process-local store used for single-node deployments and tests.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};

use concord_common::{
    ClusterError, EntityId, Invalidation, MasterElectionRecord, NodeRecord, PropertyEntry,
    ReplayEntry, Result,
};

use super::ClusterStore;

#[derive(Default)]
struct Tables {
    nodes: BTreeMap<String, NodeRecord>,
    usage: HashMap<String, BTreeMap<String, u64>>,
    master: MasterElectionRecord,
    replay_ids: HashMap<String, i64>,
    properties: BTreeMap<String, PropertyEntry>,
    next_property_id: EntityId,
}

/// Buffered invalidations before a slow subscriber skips ahead
const INVALIDATION_CAPACITY: usize = 256;

/// In-memory implementation of [`ClusterStore`]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    /// Number of upcoming calls that fail with a transient error
    injected_failures: AtomicUsize,
    invalidations: broadcast::Sender<Invalidation>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            tables: RwLock::new(Tables::default()),
            injected_failures: AtomicUsize::new(0),
            invalidations,
        }
    }

    /// Make the next `count` store calls fail with `TransientStore`
    pub fn fail_next(&self, count: usize) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<()> {
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(ClusterError::TransientStore("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_fault()
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        self.check_fault()?;
        Ok(self.tables.read().await.nodes.get(node_id).cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.check_fault()?;
        Ok(self.tables.read().await.nodes.values().cloned().collect())
    }

    async fn insert_node(&self, record: &NodeRecord) -> Result<()> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        if tables.nodes.contains_key(&record.node_id) {
            return Err(ClusterError::StaleConflict(format!(
                "node {} already registered",
                record.node_id
            )));
        }
        tables.nodes.insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn update_node(&self, record: &NodeRecord) -> Result<()> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        match tables.nodes.get_mut(&record.node_id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("node {}", record.node_id))),
        }
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        tables.usage.remove(node_id);
        Ok(tables.nodes.remove(node_id).is_some())
    }

    async fn record_usage(&self, node_id: &str, service: &str, requests: u64) -> Result<()> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        *tables
            .usage
            .entry(node_id.to_string())
            .or_default()
            .entry(service.to_string())
            .or_default() += requests;
        Ok(())
    }

    async fn node_usage(&self, node_id: &str) -> Result<Vec<(String, u64)>> {
        self.check_fault()?;
        let tables = self.tables.read().await;
        Ok(tables
            .usage
            .get(node_id)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn read_master(&self) -> Result<MasterElectionRecord> {
        self.check_fault()?;
        Ok(self.tables.read().await.master.clone())
    }

    async fn cas_master(
        &self,
        expected_version: i64,
        node_id: &str,
        touched_time: i64,
    ) -> Result<bool> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        if tables.master.version != expected_version {
            return Ok(false);
        }
        tables.master = MasterElectionRecord {
            master_node_id: node_id.to_string(),
            touched_time,
            version: expected_version + 1,
        };
        Ok(true)
    }

    async fn insert_replay_ids(&self, entries: &[ReplayEntry]) -> Result<usize> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        let mut inserted = 0;
        for entry in entries {
            match tables.replay_ids.get_mut(&entry.message_id) {
                Some(expires) => *expires = (*expires).max(entry.expires),
                None => {
                    tables
                        .replay_ids
                        .insert(entry.message_id.clone(), entry.expires);
                    inserted += 1;
                }
            }
        }
        Ok(inserted)
    }

    async fn claim_replay_id(&self, entry: &ReplayEntry, now: i64) -> Result<bool> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        if tables
            .replay_ids
            .get(&entry.message_id)
            .is_some_and(|expires| *expires >= now)
        {
            return Ok(false);
        }
        tables
            .replay_ids
            .insert(entry.message_id.clone(), entry.expires);
        Ok(true)
    }

    async fn replay_ids_valid_at(&self, now: i64) -> Result<Vec<ReplayEntry>> {
        self.check_fault()?;
        let tables = self.tables.read().await;
        Ok(tables
            .replay_ids
            .iter()
            .filter(|(_, expires)| **expires >= now)
            .map(|(id, expires)| ReplayEntry {
                message_id: id.clone(),
                expires: *expires,
            })
            .collect())
    }

    async fn delete_expired_replay_ids(&self, now: i64) -> Result<u64> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        let before = tables.replay_ids.len();
        tables.replay_ids.retain(|_, expires| *expires >= now);
        Ok((before - tables.replay_ids.len()) as u64)
    }

    async fn get_property(&self, name: &str) -> Result<Option<PropertyEntry>> {
        self.check_fault()?;
        Ok(self.tables.read().await.properties.get(name).cloned())
    }

    async fn get_property_by_id(&self, id: EntityId) -> Result<Option<PropertyEntry>> {
        self.check_fault()?;
        let tables = self.tables.read().await;
        Ok(tables.properties.values().find(|p| p.id == id).cloned())
    }

    async fn list_properties(&self) -> Result<Vec<PropertyEntry>> {
        self.check_fault()?;
        Ok(self.tables.read().await.properties.values().cloned().collect())
    }

    async fn save_property(
        &self,
        name: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> Result<PropertyEntry> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;

        let current_version = tables.properties.get(name).map(|p| p.version);
        if current_version != expected_version {
            return Err(ClusterError::StaleConflict(format!(
                "property {name}: expected version {expected_version:?}, found {current_version:?}"
            )));
        }

        let entry = match tables.properties.get(name) {
            Some(existing) => PropertyEntry {
                value: value.to_string(),
                version: existing.version + 1,
                ..existing.clone()
            },
            None => {
                tables.next_property_id += 1;
                PropertyEntry {
                    id: tables.next_property_id,
                    name: name.to_string(),
                    value: value.to_string(),
                    version: 1,
                }
            }
        };
        tables.properties.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    async fn delete_property(
        &self,
        name: &str,
        expected_version: Option<i64>,
    ) -> Result<Option<PropertyEntry>> {
        self.check_fault()?;
        let mut tables = self.tables.write().await;
        match (tables.properties.get(name), expected_version) {
            (None, _) => Ok(None),
            (Some(existing), Some(expected)) if existing.version != expected => {
                Err(ClusterError::StaleConflict(format!(
                    "property {name}: expected version {expected}, found {}",
                    existing.version
                )))
            }
            _ => Ok(tables.properties.remove(name)),
        }
    }

    async fn publish_invalidation(&self, invalidation: &Invalidation) -> Result<()> {
        self.check_fault()?;
        // Nobody subscribed yet is fine
        let _ = self.invalidations.send(invalidation.clone());
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> Result<BoxStream<'static, Invalidation>> {
        self.check_fault()?;
        let rx = self.invalidations.subscribe();
        Ok(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(invalidation) => return Some((invalidation, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Invalidation subscriber fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_cas_master_single_winner() {
        let store = MemoryStore::new();

        assert!(store.cas_master(0, "a", 100).await.unwrap());
        assert!(!store.cas_master(0, "b", 100).await.unwrap());

        let row = store.read_master().await.unwrap();
        assert_eq!(row.master_node_id, "a");
        assert_eq!(row.version, 1);
    }

    #[tokio::test]
    async fn test_property_versions() {
        let store = MemoryStore::new();

        let created = store.save_property("foo", "1", None).await.unwrap();
        assert_eq!(created.version, 1);

        // Insert over an existing row is a conflict
        assert_err!(store.save_property("foo", "x", None).await);

        let updated = store.save_property("foo", "2", Some(1)).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.id, created.id);

        assert_err!(store.delete_property("foo", Some(1)).await);
        let removed = assert_ok!(store.delete_property("foo", Some(2)).await);
        assert_eq!(removed.map(|p| p.value), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_replay_ids_keep_later_expiry() {
        let store = MemoryStore::new();
        let entries = vec![
            ReplayEntry { message_id: "a".into(), expires: 1_000 },
            ReplayEntry { message_id: "b".into(), expires: 3_000 },
        ];

        assert_eq!(store.insert_replay_ids(&entries).await.unwrap(), 2);
        assert_eq!(store.insert_replay_ids(&entries).await.unwrap(), 0);

        // A reused id extends its row; an older expiry never shortens it
        let reused = [ReplayEntry { message_id: "a".into(), expires: 9_000 }];
        assert_eq!(store.insert_replay_ids(&reused).await.unwrap(), 0);
        let stale = [ReplayEntry { message_id: "a".into(), expires: 500 }];
        store.insert_replay_ids(&stale).await.unwrap();
        let valid = store.replay_ids_valid_at(5_000).await.unwrap();
        assert_eq!(valid, vec![ReplayEntry { message_id: "a".into(), expires: 9_000 }]);
    }

    #[tokio::test]
    async fn test_replay_ids_expire() {
        let store = MemoryStore::new();
        let entries = vec![
            ReplayEntry { message_id: "a".into(), expires: 1_000 },
            ReplayEntry { message_id: "b".into(), expires: 3_000 },
        ];
        store.insert_replay_ids(&entries).await.unwrap();

        let valid = store.replay_ids_valid_at(2_000).await.unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].message_id, "b");

        assert_eq!(store.delete_expired_replay_ids(2_000).await.unwrap(), 1);
        assert_eq!(store.replay_ids_valid_at(0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_replay_id_single_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let entry = ReplayEntry { message_id: "m".into(), expires: 1_000 };

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let entry = entry.clone();
            handles.push(tokio::spawn(async move {
                store.claim_replay_id(&entry, 0).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        // Still valid at its expiry; free again after it
        assert!(!store.claim_replay_id(&entry, 1_000).await.unwrap());
        let reused = ReplayEntry { message_id: "m".into(), expires: 5_000 };
        assert!(store.claim_replay_id(&reused, 1_001).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidations_reach_every_subscriber() {
        let store = MemoryStore::new();
        let mut first = store.subscribe_invalidations().await.unwrap();
        let mut second = store.subscribe_invalidations().await.unwrap();

        let invalidation = Invalidation { origin: "a".into(), ids: vec![7] };
        store.publish_invalidation(&invalidation).await.unwrap();

        assert_eq!(first.next().await, Some(invalidation.clone()));
        assert_eq!(second.next().await, Some(invalidation));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(1);

        let err = store.ping().await.unwrap_err();
        assert!(err.is_retryable());
        assert_ok!(store.ping().await);
    }
}
