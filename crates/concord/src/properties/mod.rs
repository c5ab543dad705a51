//! Cached cluster properties.
//!
//! The whole property set is loaded once at construction. After that only
//! invalidation events change the cache: each invalidated id is re-read from
//! the store and its snapshot replaced wholesale, so readers never see a
//! half-updated entry. Reads never touch the store.
//!
//! Local writes are announced on the in-process [`InvalidationBus`] and
//! through the store to every other node; a relay task feeds the ids other
//! nodes announce back into the local bus.

pub mod lock;

pub use lock::DistributedLock;

use futures::StreamExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use concord_common::{ClusterError, EntityId, Invalidation, PropertyEntry, Result};

use crate::store::ClusterStore;

/// Capacity of the invalidation channel before slow receivers lag
const BUS_CAPACITY: usize = 256;

/// Pause before subscribing again after the store subscription dropped
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Observer of property changes.
///
/// `old` is `None` for a newly created property, `new` is `None` for a
/// deleted one.
pub trait PropertyListener: Send + Sync {
    fn property_changed(
        &self,
        old: Option<&PropertyEntry>,
        new: Option<&PropertyEntry>,
    ) -> anyhow::Result<()>;
}

/// Fan-out of changed entity ids to every cache in the process
#[derive(Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<Vec<EntityId>>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, ids: Vec<EntityId>) {
        // No receivers is fine: nothing is cached yet
        let _ = self.tx.send(ids);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<EntityId>> {
        self.tx.subscribe()
    }
}

#[derive(Default)]
struct Snapshot {
    by_name: HashMap<String, Arc<PropertyEntry>>,
    names_by_id: HashMap<EntityId, String>,
}

impl Snapshot {
    /// Insert `entry`, returning the entry it displaced when its name was
    /// recreated under a new id
    fn insert(&mut self, entry: Arc<PropertyEntry>) -> Option<Arc<PropertyEntry>> {
        self.names_by_id.insert(entry.id, entry.name.clone());
        let previous = self.by_name.insert(entry.name.clone(), entry.clone())?;
        if previous.id == entry.id {
            return None;
        }
        self.names_by_id.remove(&previous.id);
        Some(previous)
    }

    fn remove_id(&mut self, id: EntityId) -> Option<Arc<PropertyEntry>> {
        let name = self.names_by_id.remove(&id)?;
        self.by_name.remove(&name)
    }
}

/// Read-mostly cache of cluster properties
pub struct PropertyCache {
    store: Arc<dyn ClusterStore>,
    bus: InvalidationBus,
    /// Tags this cache's announcements so the relay skips its own
    origin: String,
    snapshot: RwLock<Snapshot>,
    listeners: RwLock<Vec<Arc<dyn PropertyListener>>>,
}

impl PropertyCache {
    /// Build the cache, loading every property from the store
    pub async fn load(store: Arc<dyn ClusterStore>, bus: InvalidationBus) -> Result<Self> {
        let mut snapshot = Snapshot::default();
        for entry in store.list_properties().await? {
            let _ = snapshot.insert(Arc::new(entry));
        }
        tracing::info!(properties = snapshot.by_name.len(), "Property cache loaded");

        Ok(Self {
            store,
            bus,
            origin: uuid::Uuid::new_v4().simple().to_string(),
            snapshot: RwLock::new(snapshot),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub async fn get(&self, name: &str) -> Option<Arc<PropertyEntry>> {
        self.snapshot.read().await.by_name.get(name).cloned()
    }

    /// Every cached property, ordered by name
    pub async fn all(&self) -> Vec<Arc<PropertyEntry>> {
        let snapshot = self.snapshot.read().await;
        let mut entries: Vec<_> = snapshot.by_name.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub async fn add_listener(&self, listener: Arc<dyn PropertyListener>) {
        self.listeners.write().await.push(listener);
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    /// Re-read each id from the store and apply the result
    pub async fn on_invalidate(&self, ids: &[EntityId]) -> Result<()> {
        for &id in ids {
            let fresh = self.store.get_property_by_id(id).await?;
            self.apply(id, fresh).await;
        }
        Ok(())
    }

    /// Read one property straight from the store, refreshing the cache
    pub async fn reload(&self, name: &str) -> Result<Option<Arc<PropertyEntry>>> {
        match self.store.get_property(name).await? {
            Some(entry) => {
                let id = entry.id;
                self.apply(id, Some(entry)).await;
                Ok(self.get(name).await)
            }
            None => {
                let cached = self.get(name).await;
                if let Some(stale) = cached {
                    self.apply(stale.id, None).await;
                }
                Ok(None)
            }
        }
    }

    /// Create or update a property through the store's optimistic path.
    ///
    /// `expected_version` is `None` to create; otherwise it must match the
    /// stored version or the call fails with `StaleConflict`.
    pub async fn save(
        &self,
        name: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> Result<Arc<PropertyEntry>> {
        let entry = match self.store.save_property(name, value, expected_version).await {
            Ok(entry) => entry,
            Err(ClusterError::StaleConflict(reason)) => {
                tracing::debug!(property = %name, reason = %reason, "Property update lost a race");
                return Err(ClusterError::StaleConflict(reason));
            }
            Err(e) => return Err(e),
        };

        let id = entry.id;
        self.apply(id, Some(entry)).await;
        self.announce(vec![id]).await;
        self.get(name)
            .await
            .ok_or_else(|| ClusterError::NotFound(format!("property {name}")))
    }

    /// Delete a property. Returns false if it did not exist.
    pub async fn delete(&self, name: &str, expected_version: Option<i64>) -> Result<bool> {
        let Some(removed) = self.store.delete_property(name, expected_version).await? else {
            return Ok(false);
        };
        self.apply(removed.id, None).await;
        self.announce(vec![removed.id]).await;
        Ok(true)
    }

    /// Publish changed ids in-process and to the other nodes
    async fn announce(&self, ids: Vec<EntityId>) {
        self.bus.publish(ids.clone());
        let invalidation = Invalidation {
            origin: self.origin.clone(),
            ids,
        };
        if let Err(e) = self.store.publish_invalidation(&invalidation).await {
            tracing::warn!(error = %e, ids = ?invalidation.ids, "Failed to announce property change");
        }
    }

    /// Reconcile the whole cache with the store after missed invalidations
    pub async fn resync(&self) -> Result<()> {
        let fresh = self.store.list_properties().await?;
        let fresh_ids: Vec<EntityId> = fresh.iter().map(|p| p.id).collect();
        let cached_ids: Vec<EntityId> = {
            let snapshot = self.snapshot.read().await;
            snapshot.names_by_id.keys().copied().collect()
        };

        for entry in fresh {
            let id = entry.id;
            self.apply(id, Some(entry)).await;
        }
        for id in cached_ids.into_iter().filter(|id| !fresh_ids.contains(id)) {
            self.apply(id, None).await;
        }
        Ok(())
    }

    /// Consume the invalidation bus until shutdown
    pub async fn run_invalidation_worker(
        self: Arc<Self>,
        mut events: broadcast::Receiver<Vec<EntityId>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ids) => {
                        if let Err(e) = self.on_invalidate(&ids).await {
                            tracing::warn!(error = %e, ids = ?ids, "Property invalidation failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Invalidation events dropped, resyncing properties");
                        if let Err(e) = self.resync().await {
                            tracing::warn!(error = %e, "Property resync failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Property invalidation worker stopped");
    }

    /// Relay invalidations announced by other nodes into the local bus until
    /// shutdown. A lost subscription is re-established and followed by a
    /// full resync, since announcements made meanwhile were missed.
    pub async fn run_remote_invalidations(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut reconnecting = false;
        'subscribe: loop {
            let subscribed = tokio::select! {
                subscribed = self.store.subscribe_invalidations() => subscribed,
                _ = shutdown.recv() => break,
            };

            match subscribed {
                Ok(mut events) => {
                    if reconnecting {
                        if let Err(e) = self.resync().await {
                            tracing::warn!(error = %e, "Property resync failed");
                        }
                    }
                    loop {
                        tokio::select! {
                            event = events.next() => match event {
                                Some(event) if event.origin != self.origin => {
                                    self.bus.publish(event.ids);
                                }
                                Some(_) => {}
                                None => break,
                            },
                            _ = shutdown.recv() => break 'subscribe,
                        }
                    }
                    tracing::warn!("Invalidation subscription lost");
                }
                Err(e) => tracing::warn!(error = %e, "Failed to subscribe to invalidations"),
            }

            reconnecting = true;
            tokio::select! {
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Remote invalidation relay stopped");
    }

    /// Swap the snapshot for `id` and notify listeners if it changed
    async fn apply(&self, id: EntityId, fresh: Option<PropertyEntry>) {
        let (old, new) = {
            let mut snapshot = self.snapshot.write().await;
            match fresh {
                Some(entry) => {
                    let current = snapshot
                        .names_by_id
                        .get(&id)
                        .and_then(|n| snapshot.by_name.get(n));
                    if current.is_some_and(|c| **c == entry) {
                        return;
                    }
                    let old = snapshot.remove_id(id);
                    let new = Arc::new(entry);
                    let displaced = snapshot.insert(new.clone());
                    (old.or(displaced), Some(new))
                }
                None => match snapshot.remove_id(id) {
                    Some(old) => (Some(old), None),
                    None => return,
                },
            }
        };

        let name = old.as_ref().or(new.as_ref()).map(|p| p.name.clone());
        tracing::debug!(id, property = ?name, deleted = new.is_none(), "Property changed");
        self.notify(old.as_deref(), new.as_deref()).await;
    }

    async fn notify(&self, old: Option<&PropertyEntry>, new: Option<&PropertyEntry>) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.property_changed(old, new)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Property listener failed"),
                Err(_) => tracing::error!("Property listener panicked"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::store::MemoryStore;

    type Change = (Option<String>, Option<String>);

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<Change>>,
    }

    impl PropertyListener for Recorder {
        fn property_changed(
            &self,
            old: Option<&PropertyEntry>,
            new: Option<&PropertyEntry>,
        ) -> anyhow::Result<()> {
            self.changes.lock().unwrap().push((
                old.map(|p| p.value.clone()),
                new.map(|p| p.value.clone()),
            ));
            Ok(())
        }
    }

    struct Failing;

    impl PropertyListener for Failing {
        fn property_changed(
            &self,
            _old: Option<&PropertyEntry>,
            _new: Option<&PropertyEntry>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("listener exploded")
        }
    }

    struct Panicking;

    impl PropertyListener for Panicking {
        fn property_changed(
            &self,
            _old: Option<&PropertyEntry>,
            _new: Option<&PropertyEntry>,
        ) -> anyhow::Result<()> {
            panic!("listener panicked")
        }
    }

    #[tokio::test]
    async fn test_invalidation_replaces_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let foo = store.save_property("foo", "1", None).await.unwrap();
        let cache = PropertyCache::load(store.clone(), InvalidationBus::new()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone()).await;

        // Written behind the cache's back; reads still see the old snapshot
        store.save_property("foo", "2", Some(1)).await.unwrap();
        assert_eq!(cache.get("foo").await.unwrap().value, "1");

        cache.on_invalidate(&[foo.id]).await.unwrap();
        assert_eq!(cache.get("foo").await.unwrap().value, "2");

        // A repeated event for an unchanged row does not notify again
        cache.on_invalidate(&[foo.id]).await.unwrap();
        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![(Some("1".to_string()), Some("2".to_string()))]);
    }

    #[tokio::test]
    async fn test_invalidation_of_deleted_row_removes_entry() {
        let store = Arc::new(MemoryStore::new());
        let foo = store.save_property("foo", "1", None).await.unwrap();
        let cache = PropertyCache::load(store.clone(), InvalidationBus::new()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone()).await;

        store.delete_property("foo", None).await.unwrap();
        cache.on_invalidate(&[foo.id]).await.unwrap();

        assert!(cache.get("foo").await.is_none());
        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![(Some("1".to_string()), None)]);
    }

    #[tokio::test]
    async fn test_bad_listeners_are_isolated() {
        let store = Arc::new(MemoryStore::new());
        let cache = PropertyCache::load(store, InvalidationBus::new()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(Arc::new(Failing)).await;
        cache.add_listener(Arc::new(Panicking)).await;
        cache.add_listener(recorder.clone()).await;

        cache.save("foo", "1", None).await.unwrap();

        assert_eq!(cache.get("foo").await.unwrap().value, "1");
        assert_eq!(recorder.changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_publishes_and_checks_version() {
        let store = Arc::new(MemoryStore::new());
        let bus = InvalidationBus::new();
        let mut events = bus.subscribe();
        let cache = PropertyCache::load(store, bus).await.unwrap();

        let created = cache.save("foo", "1", None).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), vec![created.id]);

        let err = cache.save("foo", "2", None).await.unwrap_err();
        assert!(matches!(err, ClusterError::StaleConflict(_)));

        let updated = cache.save("foo", "2", Some(created.version)).await.unwrap();
        assert_eq!(updated.version, created.version + 1);
        assert!(cache.delete("foo", None).await.unwrap());
        assert!(cache.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_applies_events_from_peers() {
        let store = Arc::new(MemoryStore::new());
        let bus = InvalidationBus::new();
        let cache = Arc::new(PropertyCache::load(store.clone(), bus.clone()).await.unwrap());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker =
            tokio::spawn(cache.clone().run_invalidation_worker(bus.subscribe(), shutdown_rx));

        // Another writer saves through the store and publishes the id
        let entry = store.save_property("bar", "x", None).await.unwrap();
        bus.publish(vec![entry.id]);

        for _ in 0..50 {
            if cache.get("bar").await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(cache.get("bar").await.unwrap().value, "x");

        shutdown_tx.send(()).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_recreated_name_reports_displaced_entry() {
        let store = Arc::new(MemoryStore::new());
        let first = store.save_property("foo", "1", None).await.unwrap();
        let cache = PropertyCache::load(store.clone(), InvalidationBus::new()).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        cache.add_listener(recorder.clone()).await;

        store.delete_property("foo", None).await.unwrap();
        let second = store.save_property("foo", "2", None).await.unwrap();
        assert_ne!(first.id, second.id);

        // Only the new id is announced
        cache.on_invalidate(&[second.id]).await.unwrap();
        assert_eq!(cache.get("foo").await.unwrap().id, second.id);
        // The old id is already gone, so its own event changes nothing
        cache.on_invalidate(&[first.id]).await.unwrap();

        let changes = recorder.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![(Some("1".to_string()), Some("2".to_string()))]);
    }

    #[tokio::test]
    async fn test_changes_reach_caches_on_other_nodes() {
        let store = Arc::new(MemoryStore::new());
        // Each node has its own bus; only the store is shared
        let writer = PropertyCache::load(store.clone(), InvalidationBus::new()).await.unwrap();
        let reader_bus = InvalidationBus::new();
        let reader = Arc::new(PropertyCache::load(store.clone(), reader_bus.clone()).await.unwrap());

        let (shutdown_tx, _) = broadcast::channel(1);
        let worker = tokio::spawn(
            reader
                .clone()
                .run_invalidation_worker(reader_bus.subscribe(), shutdown_tx.subscribe()),
        );
        let relay = tokio::spawn(reader.clone().run_remote_invalidations(shutdown_tx.subscribe()));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        writer.save("foo", "1", None).await.unwrap();
        for _ in 0..100 {
            if reader.get("foo").await.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(reader.get("foo").await.unwrap().value, "1");

        shutdown_tx.send(()).unwrap();
        worker.await.unwrap();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_resync_drops_missing_rows() {
        let store = Arc::new(MemoryStore::new());
        store.save_property("gone", "1", None).await.unwrap();
        let cache = PropertyCache::load(store.clone(), InvalidationBus::new()).await.unwrap();

        store.delete_property("gone", None).await.unwrap();
        store.save_property("new", "1", None).await.unwrap();
        cache.resync().await.unwrap();

        let names: Vec<String> = cache.all().await.iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["new".to_string()]);
    }
}
