//! Best-effort, non-blocking lock stored in a cluster property.
//!
//! The property value is a [`LockEntry`]. Acquisition and release are
//! ordinary optimistic property writes: losing the version race means the
//! lock was not acquired, and nothing is retried.

use std::sync::Arc;
use std::time::Duration;

use concord_common::{ClusterError, LockEntry, PropertyEntry, Result, now_millis};

use super::PropertyCache;

pub struct DistributedLock {
    cache: Arc<PropertyCache>,
    name: String,
    owner_id: String,
    /// Age after which a held lock may be stolen; `None` never steals
    staleness: Option<Duration>,
}

impl DistributedLock {
    pub fn new(
        cache: Arc<PropertyCache>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
        staleness: Option<Duration>,
    ) -> Self {
        Self {
            cache,
            name: name.into(),
            owner_id: owner_id.into(),
            staleness,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn try_lock(&self) -> Result<bool> {
        self.try_lock_at(now_millis()).await
    }

    pub async fn try_lock_at(&self, now: i64) -> Result<bool> {
        let current = self.cache.reload(&self.name).await?;

        let expected_version = match current {
            None => None,
            Some(ref entry) => match self.parse(entry) {
                Some(held) if held.locked => {
                    if !self.is_stale(&held, now) {
                        return Ok(false);
                    }
                    tracing::warn!(
                        lock = %self.name,
                        owner = %held.owner_id,
                        age_ms = held.age_millis(now),
                        "Stealing stale lock"
                    );
                    Some(entry.version)
                }
                _ => Some(entry.version),
            },
        };

        let entry = LockEntry::new(true, now, self.owner_id.as_str());
        self.write(&entry, expected_version).await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.unlock_at(now_millis()).await
    }

    /// Release the lock if this node holds it; otherwise log and do nothing
    pub async fn unlock_at(&self, now: i64) -> Result<()> {
        let current = self.cache.reload(&self.name).await?;
        let held = current
            .as_deref()
            .and_then(|entry| self.parse(entry).map(|held| (held, entry.version)));

        match held {
            Some((held, version)) if held.locked && held.owner_id == self.owner_id => {
                let entry = LockEntry::new(false, now, self.owner_id.as_str());
                if !self.write(&entry, Some(version)).await? {
                    tracing::warn!(lock = %self.name, "Unlock lost a concurrent update");
                }
            }
            Some((held, _)) => {
                tracing::warn!(
                    lock = %self.name,
                    owner = %held.owner_id,
                    locked = held.locked,
                    "Unlock ignored, lock not held by this node"
                );
            }
            None => {
                tracing::warn!(lock = %self.name, "Unlock ignored, lock does not exist");
            }
        }
        Ok(())
    }

    pub async fn lock(&self) -> Result<()> {
        Err(ClusterError::Unsupported("blocking lock"))
    }

    pub async fn lock_interruptibly(&self) -> Result<()> {
        Err(ClusterError::Unsupported("interruptible lock"))
    }

    pub async fn try_lock_timeout(&self, _timeout: Duration) -> Result<bool> {
        Err(ClusterError::Unsupported("timed lock"))
    }

    pub fn new_condition(&self) -> Result<()> {
        Err(ClusterError::Unsupported("lock conditions"))
    }

    fn parse(&self, entry: &PropertyEntry) -> Option<LockEntry> {
        match entry.value.parse::<LockEntry>() {
            Ok(held) => Some(held),
            Err(e) => {
                tracing::warn!(lock = %self.name, error = %e, "Unreadable lock entry, treating as free");
                None
            }
        }
    }

    fn is_stale(&self, held: &LockEntry, now: i64) -> bool {
        self.staleness
            .is_some_and(|limit| held.age_millis(now) > limit.as_millis() as i64)
    }

    /// Version-checked write; a lost race is `false`, not an error
    async fn write(&self, entry: &LockEntry, expected_version: Option<i64>) -> Result<bool> {
        match self
            .cache
            .save(&self.name, &entry.to_string(), expected_version)
            .await
        {
            Ok(_) => Ok(true),
            Err(ClusterError::StaleConflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
