//! Shared durable store on Redis.
//!
//! Rows are stored as JSON strings (nodes, properties) or hashes (master row)
//! with index keys for enumeration. Version-checked writes run as Lua scripts
//! so the compare and the write are one atomic step on the server.

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::LazyLock;

use concord_common::constants::redis_keys;
use concord_common::{
    ClusterError, EntityId, Invalidation, MasterElectionRecord, NodeRecord, PropertyEntry,
    ReplayEntry, Result,
};

use super::ClusterStore;

/// KEYS[1] = master hash; ARGV = expected version, node id, touched time
static CAS_MASTER: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
        if current ~= tonumber(ARGV[1]) then
            return 0
        end
        redis.call('HSET', KEYS[1], 'nodeid', ARGV[2], 'touched_time', ARGV[3], 'version', current + 1)
        return 1
        ",
    )
});

/// KEYS = property row, id sequence, id index; ARGV = expected version ('' = absent), value, name
static SAVE_PROPERTY: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if current then
            local row = cjson.decode(current)
            if ARGV[1] == '' or tonumber(ARGV[1]) ~= row.version then
                return false
            end
            row.value = ARGV[2]
            row.version = row.version + 1
            local encoded = cjson.encode(row)
            redis.call('SET', KEYS[1], encoded)
            return encoded
        end
        if ARGV[1] ~= '' then
            return false
        end
        local id = redis.call('INCR', KEYS[2])
        local encoded = cjson.encode({id = id, name = ARGV[3], value = ARGV[2], version = 1})
        redis.call('SET', KEYS[1], encoded)
        redis.call('HSET', KEYS[3], id, ARGV[3])
        return encoded
        ",
    )
});

/// KEYS = property row, id index; ARGV = expected version ('' = any)
/// Returns the removed row, nil if absent, or the string 'conflict'.
static DELETE_PROPERTY: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if not current then
            return false
        end
        local row = cjson.decode(current)
        if ARGV[1] ~= '' and tonumber(ARGV[1]) ~= row.version then
            return 'conflict'
        end
        redis.call('DEL', KEYS[1])
        redis.call('HDEL', KEYS[2], row.id)
        return current
        ",
    )
});

/// KEYS[1] = replay id set; ARGV = message id, expires, now
static CLAIM_REPLAY_ID: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
        if current and tonumber(current) >= tonumber(ARGV[3]) then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
        return 1
        ",
    )
});

/// Redis-backed implementation of [`ClusterStore`]
pub struct RedisStore {
    /// Kept for dedicated pub/sub connections
    client: redis::Client,
    /// Connection manager (auto-reconnecting)
    redis: ConnectionManager,
}

fn store_err(e: redis::RedisError) -> ClusterError {
    ClusterError::TransientStore(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| ClusterError::TransientStore(format!("corrupt {what} row: {e}")))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| ClusterError::InvalidInput(e.to_string()))
}

fn node_key(node_id: &str) -> String {
    format!("{}{}", redis_keys::NODE_PREFIX, node_id)
}

fn usage_key(node_id: &str) -> String {
    format!("{}{}", redis_keys::USAGE_PREFIX, node_id)
}

fn property_key(name: &str) -> String {
    format!("{}{}", redis_keys::PROPERTY_PREFIX, name)
}

impl RedisStore {
    /// Connect to Redis with a connection manager (handles reconnection)
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { client, redis })
    }

    fn conn(&self) -> ConnectionManager {
        self.redis.clone()
    }
}

#[async_trait]
impl ClusterStore for RedisStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(node_key(node_id)).await.map_err(store_err)?;
        raw.map(|r| decode("node", &r)).transpose()
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .smembers(redis_keys::NODE_INDEX)
            .await
            .map_err(store_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| node_key(id)).collect();
        let rows: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        let mut nodes = rows
            .into_iter()
            .flatten()
            .map(|raw| decode::<NodeRecord>("node", &raw))
            .collect::<Result<Vec<_>>>()?;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn insert_node(&self, record: &NodeRecord) -> Result<()> {
        let mut conn = self.conn();
        let created: Option<String> = redis::cmd("SET")
            .arg(node_key(&record.node_id))
            .arg(encode(record)?)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        if created.is_none() {
            return Err(ClusterError::StaleConflict(format!(
                "node {} already registered",
                record.node_id
            )));
        }
        let _: () = conn
            .sadd(redis_keys::NODE_INDEX, &record.node_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn update_node(&self, record: &NodeRecord) -> Result<()> {
        let mut conn = self.conn();
        let updated: Option<String> = redis::cmd("SET")
            .arg(node_key(&record.node_id))
            .arg(encode(record)?)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        match updated {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(format!("node {}", record.node_id))),
        }
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let (removed, _, _): (u32, u32, u32) = redis::pipe()
            .atomic()
            .del(node_key(node_id))
            .del(usage_key(node_id))
            .srem(redis_keys::NODE_INDEX, node_id)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn record_usage(&self, node_id: &str, service: &str, requests: u64) -> Result<()> {
        let mut conn = self.conn();
        let _: u64 = conn
            .hincr(usage_key(node_id), service, requests)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn node_usage(&self, node_id: &str) -> Result<Vec<(String, u64)>> {
        let mut conn = self.conn();
        let usage: HashMap<String, u64> = conn.hgetall(usage_key(node_id)).await.map_err(store_err)?;
        let mut usage: Vec<_> = usage.into_iter().collect();
        usage.sort();
        Ok(usage)
    }

    async fn read_master(&self) -> Result<MasterElectionRecord> {
        let mut conn = self.conn();
        let row: HashMap<String, String> =
            conn.hgetall(redis_keys::MASTER).await.map_err(store_err)?;

        let field = |name: &str| -> Result<i64> {
            row.get(name)
                .map(|v| v.parse::<i64>())
                .transpose()
                .map(|v| v.unwrap_or(0))
                .map_err(|e| ClusterError::TransientStore(format!("corrupt master row: {e}")))
        };

        Ok(MasterElectionRecord {
            master_node_id: row.get("nodeid").cloned().unwrap_or_default(),
            touched_time: field("touched_time")?,
            version: field("version")?,
        })
    }

    async fn cas_master(
        &self,
        expected_version: i64,
        node_id: &str,
        touched_time: i64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let applied: i32 = CAS_MASTER
            .key(redis_keys::MASTER)
            .arg(expected_version)
            .arg(node_id)
            .arg(touched_time)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(applied == 1)
    }

    async fn insert_replay_ids(&self, entries: &[ReplayEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        // GT: new members are added, existing ones only move to a later expiry
        let mut pipe = redis::pipe();
        for entry in entries {
            pipe.cmd("ZADD")
                .arg(redis_keys::REPLAY_IDS)
                .arg("GT")
                .arg(entry.expires)
                .arg(&entry.message_id);
        }

        let mut conn = self.conn();
        let added: Vec<usize> = pipe.query_async(&mut conn).await.map_err(store_err)?;
        Ok(added.into_iter().sum())
    }

    async fn claim_replay_id(&self, entry: &ReplayEntry, now: i64) -> Result<bool> {
        let mut conn = self.conn();
        let claimed: i32 = CLAIM_REPLAY_ID
            .key(redis_keys::REPLAY_IDS)
            .arg(&entry.message_id)
            .arg(entry.expires)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(claimed == 1)
    }

    async fn replay_ids_valid_at(&self, now: i64) -> Result<Vec<ReplayEntry>> {
        let mut conn = self.conn();
        let rows: Vec<(String, i64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(redis_keys::REPLAY_IDS)
            .arg(now)
            .arg("+inf")
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(rows
            .into_iter()
            .map(|(message_id, expires)| ReplayEntry { message_id, expires })
            .collect())
    }

    async fn delete_expired_replay_ids(&self, now: i64) -> Result<u64> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(redis_keys::REPLAY_IDS)
            .arg("-inf")
            .arg(format!("({now}"))
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(removed)
    }

    async fn get_property(&self, name: &str) -> Result<Option<PropertyEntry>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(property_key(name)).await.map_err(store_err)?;
        raw.map(|r| decode("property", &r)).transpose()
    }

    async fn get_property_by_id(&self, id: EntityId) -> Result<Option<PropertyEntry>> {
        let mut conn = self.conn();
        let name: Option<String> = conn
            .hget(redis_keys::PROPERTY_IDS, id)
            .await
            .map_err(store_err)?;
        match name {
            Some(name) => self.get_property(&name).await,
            None => Ok(None),
        }
    }

    async fn list_properties(&self) -> Result<Vec<PropertyEntry>> {
        let mut conn = self.conn();
        let names: HashMap<String, String> = conn
            .hgetall(redis_keys::PROPERTY_IDS)
            .await
            .map_err(store_err)?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = names.values().map(|n| property_key(n)).collect();
        let rows: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        rows.into_iter()
            .flatten()
            .map(|raw| decode("property", &raw))
            .collect()
    }

    async fn save_property(
        &self,
        name: &str,
        value: &str,
        expected_version: Option<i64>,
    ) -> Result<PropertyEntry> {
        let mut conn = self.conn();
        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();
        let saved: Option<String> = SAVE_PROPERTY
            .key(property_key(name))
            .key(redis_keys::PROPERTY_SEQ)
            .key(redis_keys::PROPERTY_IDS)
            .arg(expected)
            .arg(value)
            .arg(name)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match saved {
            Some(raw) => decode("property", &raw),
            None => Err(ClusterError::StaleConflict(format!(
                "property {name}: expected version {expected_version:?}"
            ))),
        }
    }

    async fn delete_property(
        &self,
        name: &str,
        expected_version: Option<i64>,
    ) -> Result<Option<PropertyEntry>> {
        let mut conn = self.conn();
        let expected = expected_version.map(|v| v.to_string()).unwrap_or_default();
        let removed: Option<String> = DELETE_PROPERTY
            .key(property_key(name))
            .key(redis_keys::PROPERTY_IDS)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        match removed.as_deref() {
            None => Ok(None),
            Some("conflict") => Err(ClusterError::StaleConflict(format!(
                "property {name}: expected version {expected_version:?}"
            ))),
            Some(raw) => decode("property", raw).map(Some),
        }
    }

    async fn publish_invalidation(&self, invalidation: &Invalidation) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn
            .publish(redis_keys::PROPERTY_INVALIDATIONS, encode(invalidation)?)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn subscribe_invalidations(&self) -> Result<BoxStream<'static, Invalidation>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(store_err)?;
        pubsub
            .subscribe(redis_keys::PROPERTY_INVALIDATIONS)
            .await
            .map_err(store_err)?;

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| {
                let decoded = msg
                    .get_payload::<String>()
                    .map_err(store_err)
                    .and_then(|raw| decode::<Invalidation>("invalidation", &raw));
                futures::future::ready(match decoded {
                    Ok(invalidation) => Some(invalidation),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping malformed invalidation");
                        None
                    }
                })
            })
            .boxed())
    }
}
