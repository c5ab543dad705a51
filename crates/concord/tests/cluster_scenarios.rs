//! End-to-end coordination scenarios on a shared in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord::cluster::{ClusterRegistry, MasterElector, NodeIdentity};
use concord::config::{ClusterConfig, ElectionConfig};
use concord::properties::{DistributedLock, InvalidationBus, PropertyCache, PropertyListener};
use concord::replay::{LocalMap, ReplayCache};
use concord::store::{ClusterStore, MemoryStore};
use concord_common::{ClusterError, MasterState, PropertyEntry, ReplayEntry, now_millis};

const SECOND: i64 = 1_000;

fn identity(node_id: &str) -> Arc<NodeIdentity> {
    Arc::new(NodeIdentity::new(ClusterConfig {
        node_id: Some(node_id.to_string()),
        address: Some("10.0.0.1".to_string()),
        ..Default::default()
    }))
}

fn elector(store: &Arc<MemoryStore>, node_id: &str) -> MasterElector {
    MasterElector::new(store.clone(), identity(node_id), ElectionConfig::default())
}

#[tokio::test]
async fn election_handover_after_staleness() {
    let store = Arc::new(MemoryStore::new());
    let a = elector(&store, "a");
    let b = elector(&store, "b");

    // Both tick at t=0 against the empty row; exactly one wins version 1
    let (sa, sb) = tokio::join!(a.tick_at(0), b.tick_at(0));
    let states = [sa.unwrap(), sb.unwrap()];
    let masters = states.iter().filter(|s| **s == MasterState::Master).count();
    assert_eq!(masters, 1);
    let row = store.read_master().await.unwrap();
    assert_eq!(row.version, 1);

    // At t=50s the row is past the 40s staleness timeout; the follower takes over
    let (leader, follower) = if a.is_master() { (&a, &b) } else { (&b, &a) };
    assert_eq!(follower.tick_at(50 * SECOND).await.unwrap(), MasterState::Master);
    let row = store.read_master().await.unwrap();
    assert_eq!(row.version, 2);
    assert_eq!(follower.fencing_token(), Some(2));

    // The old master steps down on its next tick
    assert_eq!(leader.tick_at(51 * SECOND).await.unwrap(), MasterState::Follower);
    assert_eq!(leader.fencing_token(), None);
}

#[derive(Default)]
struct Recorder {
    changes: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl PropertyListener for Recorder {
    fn property_changed(
        &self,
        old: Option<&PropertyEntry>,
        new: Option<&PropertyEntry>,
    ) -> anyhow::Result<()> {
        self.changes
            .lock()
            .unwrap()
            .push((old.map(|p| p.value.clone()), new.map(|p| p.value.clone())));
        Ok(())
    }
}

#[tokio::test]
async fn property_invalidation_notifies_once() {
    let store = Arc::new(MemoryStore::new());
    let foo = store.save_property("foo", "1", None).await.unwrap();

    let cache = PropertyCache::load(store.clone(), InvalidationBus::new())
        .await
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    cache.add_listener(recorder.clone()).await;

    store.save_property("foo", "2", Some(foo.version)).await.unwrap();
    cache.on_invalidate(&[foo.id]).await.unwrap();

    assert_eq!(cache.get("foo").await.unwrap().value, "2");
    let changes = recorder.changes.lock().unwrap().clone();
    assert_eq!(changes, vec![(Some("1".to_string()), Some("2".to_string()))]);
}

#[tokio::test]
async fn replay_duplicate_then_expiry() {
    let store = Arc::new(MemoryStore::new());
    let cache = ReplayCache::new(
        Box::new(LocalMap::new("a")),
        store,
        Duration::from_secs(1),
    );
    let t = 100 * SECOND;

    cache.assert_unique_at("token", t + 10 * SECOND, t).await.unwrap();
    let err = cache
        .assert_unique_at("token", t + 10 * SECOND, t + SECOND)
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Duplicate(_)));

    // After expiry a fresh assertion succeeds
    cache
        .assert_unique_at("token", t + 30 * SECOND, t + 11 * SECOND)
        .await
        .unwrap();
}

#[tokio::test]
async fn replay_repopulation_after_backend_loss() {
    let store = Arc::new(MemoryStore::new());
    let not_valid_after = now_millis() + 60 * SECOND;

    let first = ReplayCache::new(
        Box::new(LocalMap::new("a")),
        store.clone(),
        Duration::from_secs(1),
    );
    first.assert_unique("seen-1", not_valid_after).await.unwrap();
    first.assert_unique("seen-2", not_valid_after).await.unwrap();
    assert_eq!(first.flush().await.unwrap(), 2);

    // A fresh, empty backend (as after a restart) refilled from the store
    let second = ReplayCache::new(
        Box::new(LocalMap::new("a")),
        store.clone(),
        Duration::from_secs(1),
    );
    assert_eq!(second.populate().await.unwrap(), 2);
    for id in ["seen-1", "seen-2"] {
        let err = second.assert_unique(id, not_valid_after).await.unwrap_err();
        assert!(matches!(err, ClusterError::Duplicate(_)));
    }
    // Restored entries are already flushed
    assert_eq!(second.flush().await.unwrap(), 0);
}

#[tokio::test]
async fn replay_population_skips_expired_rows() {
    let store = Arc::new(MemoryStore::new());
    let now = now_millis();
    store
        .insert_replay_ids(&[
            ReplayEntry {
                message_id: "old".to_string(),
                expires: now - SECOND,
            },
            ReplayEntry {
                message_id: "live".to_string(),
                expires: now + 60 * SECOND,
            },
        ])
        .await
        .unwrap();

    let cache = ReplayCache::new(
        Box::new(LocalMap::new("a")),
        store.clone(),
        Duration::from_secs(1),
    );
    assert_eq!(cache.populate().await.unwrap(), 1);
    assert!(cache.assert_unique("old", now + 60 * SECOND).await.is_ok());
}

#[tokio::test]
async fn lock_theft_after_staleness() {
    let store = Arc::new(MemoryStore::new());
    let bus = InvalidationBus::new();
    // Separate caches, as on two nodes
    let cache_a = Arc::new(PropertyCache::load(store.clone(), bus.clone()).await.unwrap());
    let cache_b = Arc::new(PropertyCache::load(store.clone(), bus).await.unwrap());
    let staleness = Some(Duration::from_secs(30));
    let a = DistributedLock::new(cache_a, "cleanup", "a", staleness);
    let b = DistributedLock::new(cache_b.clone(), "cleanup", "b", staleness);

    assert!(a.try_lock_at(0).await.unwrap());
    assert!(!b.try_lock_at(10 * SECOND).await.unwrap());
    assert!(b.try_lock_at(31 * SECOND).await.unwrap());

    // The original owner's unlock is a no-op; the thief's succeeds
    a.unlock_at(32 * SECOND).await.unwrap();
    let held = store.get_property("cleanup").await.unwrap().unwrap();
    assert_eq!(held.value, format!("true:{}:b", 31 * SECOND));

    b.unlock_at(33 * SECOND).await.unwrap();
    let released = store.get_property("cleanup").await.unwrap().unwrap();
    assert_eq!(released.value, format!("false:{}:b", 33 * SECOND));
}

#[tokio::test]
async fn node_removal_requires_staleness() {
    let store = Arc::new(MemoryStore::new());
    let a = ClusterRegistry::new(store.clone(), identity("a"), None);
    let b = ClusterRegistry::new(store.clone(), identity("b"), None);

    let record_b = b.heartbeat(0.5).await.unwrap();
    a.self_record().await.unwrap();
    store.record_usage("b", "gateway", 10).await.unwrap();

    let err = a.remove_at("b", record_b.last_update + 5 * SECOND).await.unwrap_err();
    assert!(matches!(err, ClusterError::NotStale { .. }));

    a.remove_at("b", record_b.last_update + 31 * SECOND).await.unwrap();
    assert!(store.get_node("b").await.unwrap().is_none());
    assert!(store.node_usage("b").await.unwrap().is_empty());

    let names: Vec<String> = a.list_all().await.unwrap().into_iter().map(|n| n.name).collect();
    assert_eq!(names, vec!["SSG2".to_string()]);
}
