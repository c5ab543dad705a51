//! Replay map on the shared Redis coordination service.
//!
//! Each message id is one key with a native TTL. The conditional put runs as a
//! Lua script, so at most one node wins a given id even under concurrent
//! checks. An index set tracks keys for enumeration and is pruned lazily.

use anyhow::Context;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::LazyLock;
use std::time::Duration;

use concord_common::constants::redis_keys;
use concord_common::{ClusterError, Result};

use super::map::{DistributedMap, ExpiredBefore, ReplayValue};

/// KEYS = entry, index; ARGV = value, ttl millis, now, bare key
static PUT_IF_ABSENT_OR_EXPIRED: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if current then
            local expiry = tonumber(string.match(current, '^(-?%d+):'))
            if expiry and tonumber(ARGV[3]) <= expiry then
                return 0
            end
        end
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        redis.call('SADD', KEYS[2], ARGV[4])
        return 1
        ",
    )
});

/// KEYS[1] = entry; ARGV = expected value, new value
static REPLACE_IF_EQUAL: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
        return 1
        ",
    )
});

/// Redis-backed [`DistributedMap`]
pub struct RedisMap {
    url: String,
    redis: ConnectionManager,
}

/// Connection-level failures are what a restart can fix
fn map_err(e: redis::RedisError) -> ClusterError {
    if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
        ClusterError::BackendTimeout(e.to_string())
    } else {
        ClusterError::Backend(e.to_string())
    }
}

fn entry_key(key: &str) -> String {
    format!("{}{}", redis_keys::REPLAY_MAP_PREFIX, key)
}

impl RedisMap {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let redis = Self::manager(redis_url).await?;
        Ok(Self {
            url: redis_url.to_string(),
            redis,
        })
    }

    async fn manager(redis_url: &str) -> anyhow::Result<ConnectionManager> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl DistributedMap for RedisMap {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<ReplayValue>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(entry_key(key)).await.map_err(map_err)?;
        raw.map(|s| s.parse()).transpose()
    }

    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        value: ReplayValue,
        ttl: Duration,
        expired: ExpiredBefore,
    ) -> Result<bool> {
        let mut conn = self.conn();
        // PX requires a positive ttl
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let won: i64 = PUT_IF_ABSENT_OR_EXPIRED
            .key(entry_key(key))
            .key(redis_keys::REPLAY_MAP_INDEX)
            .arg(value.to_string())
            .arg(ttl_ms)
            .arg(expired.0)
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(won == 1)
    }

    async fn replace(&self, key: &str, expected: ReplayValue, value: ReplayValue) -> Result<bool> {
        let mut conn = self.conn();
        let replaced: i64 = REPLACE_IF_EQUAL
            .key(entry_key(key))
            .arg(expected.to_string())
            .arg(value.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(replaced == 1)
    }

    async fn get_all_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn
            .smembers(redis_keys::REPLAY_MAP_INDEX)
            .await
            .map_err(map_err)?;
        if keys.is_empty() {
            return Ok(keys);
        }

        let entry_keys: Vec<String> = keys.iter().map(|k| entry_key(k)).collect();
        // Explicit MGET: the helper degrades to GET for a single key
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&entry_keys)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let (live, gone): (Vec<_>, Vec<_>) = keys
            .into_iter()
            .zip(values)
            .partition(|(_, value)| value.is_some());
        if !gone.is_empty() {
            let gone: Vec<String> = gone.into_iter().map(|(k, _)| k).collect();
            let _: i64 = conn
                .srem(redis_keys::REPLAY_MAP_INDEX, &gone)
                .await
                .map_err(map_err)?;
        }
        Ok(live.into_iter().map(|(k, _)| k).collect())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_all_keys().await?.is_empty())
    }

    async fn restart(&mut self) -> Result<()> {
        self.redis = Self::manager(&self.url)
            .await
            .map_err(|e| ClusterError::Backend(format!("{e:#}")))?;
        tracing::info!("Redis replay map reconnected");
        Ok(())
    }
}
