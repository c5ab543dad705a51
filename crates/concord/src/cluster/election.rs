//! Master election over a single shared row.
//!
//! Each tick reads the `MasterElectionRecord` and either refreshes it (when
//! this node is master), takes it over (when it has gone stale), or leaves it
//! alone. Every write is a compare-and-swap on the row version, so the first
//! committed CAS wins and no further coordination is needed. Two nodes may
//! both believe they are master for at most one interval after a handover.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use concord_common::{MasterElectionRecord, MasterState, Result, now_millis};

use super::identity::NodeIdentity;
use crate::config::ElectionConfig;
use crate::store::ClusterStore;

/// Sentinel for "no fencing token held"
const NO_TOKEN: i64 = -1;

/// Periodic leader election participant
pub struct MasterElector {
    store: Arc<dyn ClusterStore>,
    identity: Arc<NodeIdentity>,
    config: ElectionConfig,
    master: AtomicBool,
    /// Row version written by our last successful CAS while master
    token: AtomicI64,
}

impl MasterElector {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        identity: Arc<NodeIdentity>,
        config: ElectionConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
            master: AtomicBool::new(false),
            token: AtomicI64::new(NO_TOKEN),
        }
    }

    /// Non-blocking view of the local election state
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Acquire)
    }

    pub fn state(&self) -> MasterState {
        if self.is_master() {
            MasterState::Master
        } else {
            MasterState::Follower
        }
    }

    /// Version of the master row this node last wrote while master.
    ///
    /// Callers performing master-only side effects can compare it against the
    /// current row version to detect that mastership moved on.
    pub fn fencing_token(&self) -> Option<i64> {
        match self.token.load(Ordering::Acquire) {
            NO_TOKEN => None,
            token => Some(token),
        }
    }

    /// Run one election step against the wall clock
    pub async fn tick(&self) -> Result<MasterState> {
        self.tick_at(now_millis()).await
    }

    /// Run one election step at time `now` (epoch millis)
    pub async fn tick_at(&self, now: i64) -> Result<MasterState> {
        let self_id = self.identity.self_id();

        if let Some(ref pinned) = self.config.master_override {
            let master = pinned == self_id;
            self.apply(master, None);
            return Ok(self.state());
        }

        let row = self.store.read_master().await?;

        if row.master_node_id == self_id {
            if self.store.cas_master(row.version, self_id, now).await? {
                self.apply(true, Some(row.version + 1));
            } else {
                // Lost the race; trust the fresh row, not our memory
                let fresh = self.store.read_master().await?;
                tracing::debug!(
                    observed = row.version,
                    current = fresh.version,
                    "Master refresh lost a concurrent update"
                );
                let still_master = fresh.master_node_id == self_id;
                self.apply(still_master, still_master.then_some(fresh.version));
            }
        } else if self.is_claimable(&row, now) {
            if self.store.cas_master(row.version, self_id, now).await? {
                tracing::info!(
                    previous = %row.master_node_id,
                    version = row.version + 1,
                    "Took over mastership"
                );
                self.apply(true, Some(row.version + 1));
            } else {
                tracing::debug!(version = row.version, "Lost mastership takeover race");
                self.apply(false, None);
            }
        } else {
            self.apply(false, None);
        }

        Ok(self.state())
    }

    /// An unclaimed row is free at once; a claimed one only once it is stale
    fn is_claimable(&self, row: &MasterElectionRecord, now: i64) -> bool {
        row.master_node_id.is_empty() || now - row.touched_time > self.staleness_millis()
    }

    fn staleness_millis(&self) -> i64 {
        self.config.staleness_timeout().as_millis() as i64
    }

    fn apply(&self, master: bool, token: Option<i64>) {
        self.token.store(token.unwrap_or(NO_TOKEN), Ordering::Release);
        let was_master = self.master.swap(master, Ordering::AcqRel);
        if was_master != master {
            tracing::info!(
                node_id = %self.identity.self_id(),
                state = ?self.state(),
                "Master state changed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::store::MemoryStore;

    const SECOND: i64 = 1_000;

    fn elector(store: Arc<MemoryStore>, node_id: &str, config: ElectionConfig) -> MasterElector {
        let identity = NodeIdentity::new(ClusterConfig {
            node_id: Some(node_id.to_string()),
            ..Default::default()
        });
        MasterElector::new(store, Arc::new(identity), config)
    }

    #[tokio::test]
    async fn test_first_tick_claims_empty_row() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(store.clone(), "a", ElectionConfig::default());

        assert_eq!(a.tick_at(0).await.unwrap(), MasterState::Master);
        assert!(a.is_master());
        assert_eq!(a.fencing_token(), Some(1));

        // Refresh bumps the version
        a.tick_at(10 * SECOND).await.unwrap();
        let row = store.read_master().await.unwrap();
        assert_eq!(row.version, 2);
        assert_eq!(row.touched_time, 10 * SECOND);
    }

    #[tokio::test]
    async fn test_unclaimed_row_ignores_touch_time() {
        let store = Arc::new(MemoryStore::new());
        // A freshly touched row with nobody named in it
        assert!(store.cas_master(0, "", 5 * SECOND).await.unwrap());

        let a = elector(store.clone(), "a", ElectionConfig::default());
        assert_eq!(a.tick_at(6 * SECOND).await.unwrap(), MasterState::Master);
        assert_eq!(a.fencing_token(), Some(2));
    }

    #[tokio::test]
    async fn test_follower_while_master_is_fresh() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(store.clone(), "a", ElectionConfig::default());
        let b = elector(store.clone(), "b", ElectionConfig::default());

        a.tick_at(0).await.unwrap();
        assert_eq!(b.tick_at(30 * SECOND).await.unwrap(), MasterState::Follower);
        assert_eq!(b.fencing_token(), None);
    }

    #[tokio::test]
    async fn test_lost_refresh_rereads_row() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(store.clone(), "a", ElectionConfig::default());
        a.tick_at(0).await.unwrap();

        // b steals between a's read and write by bumping the row directly
        assert!(store.cas_master(1, "b", 45 * SECOND).await.unwrap());
        assert_eq!(a.tick_at(50 * SECOND).await.unwrap(), MasterState::Follower);
        assert!(!a.is_master());
    }

    #[tokio::test]
    async fn test_override_pins_master() {
        let store = Arc::new(MemoryStore::new());
        let config = ElectionConfig {
            master_override: Some("b".to_string()),
            ..Default::default()
        };
        let a = elector(store.clone(), "a", config.clone());
        let b = elector(store.clone(), "b", config);

        assert_eq!(a.tick_at(0).await.unwrap(), MasterState::Follower);
        assert_eq!(b.tick_at(0).await.unwrap(), MasterState::Master);
        // The shared row is untouched
        assert_eq!(store.read_master().await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_state() {
        let store = Arc::new(MemoryStore::new());
        let a = elector(store.clone(), "a", ElectionConfig::default());
        a.tick_at(0).await.unwrap();

        store.fail_next(1);
        assert!(a.tick_at(10 * SECOND).await.is_err());
        assert!(a.is_master());
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.cas_master(0, &format!("n{i}"), 0).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.read_master().await.unwrap().version, 1);
    }
}
