//! Single-node replay map used when clustering is disabled.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use concord_common::Result;

use super::map::{DistributedMap, ExpiredBefore, ReplayValue};

/// Process-local map; keys are prefixed with the node id
pub struct LocalMap {
    prefix: String,
    entries: Mutex<HashMap<String, ReplayValue>>,
}

impl LocalMap {
    pub fn new(node_id: &str) -> Self {
        Self {
            prefix: format!("{node_id}:"),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn local_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl DistributedMap for LocalMap {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<ReplayValue>> {
        Ok(self.entries.lock().await.get(&self.local_key(key)).copied())
    }

    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        value: ReplayValue,
        _ttl: Duration,
        expired: ExpiredBefore,
    ) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let key = self.local_key(key);
        match entries.get(&key) {
            Some(current) if !expired.matches(current) => Ok(false),
            _ => {
                entries.insert(key, value);
                Ok(true)
            }
        }
    }

    async fn replace(&self, key: &str, expected: ReplayValue, value: ReplayValue) -> Result<bool> {
        match self.entries.lock().await.get_mut(&self.local_key(key)) {
            Some(current) if *current == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .keys()
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .map(str::to_string)
            .collect())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.lock().await.is_empty())
    }

    async fn restart(&mut self) -> Result<()> {
        Ok(())
    }

    async fn evict_expired(&self, now: i64) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, v| !v.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}
