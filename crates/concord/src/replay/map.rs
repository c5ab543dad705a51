//! Pluggable map abstraction behind the replay cache.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use concord_common::{ClusterError, Result};

/// Cached value for one message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayValue {
    /// Epoch millis after which the id may be reused
    pub expiry: i64,
    /// Already written to the durable store
    pub flushed: bool,
}

impl ReplayValue {
    pub fn pending(expiry: i64) -> Self {
        Self {
            expiry,
            flushed: false,
        }
    }

    pub fn flushed(expiry: i64) -> Self {
        Self {
            expiry,
            flushed: true,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expiry
    }
}

/// Wire form `"<expiry>:<0|1>"`
impl fmt::Display for ReplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.expiry, u8::from(self.flushed))
    }
}

impl FromStr for ReplayValue {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ClusterError::InvalidInput(format!("malformed replay value: {s}"));
        let (expiry, flushed) = s.split_once(':').ok_or_else(invalid)?;
        let expiry = expiry.parse().map_err(|_| invalid())?;
        let flushed = match flushed {
            "0" => false,
            "1" => true,
            _ => return Err(invalid()),
        };
        Ok(Self { expiry, flushed })
    }
}

/// Predicate "the existing entry's expiry has passed at `self.0`"
#[derive(Debug, Clone, Copy)]
pub struct ExpiredBefore(pub i64);

impl ExpiredBefore {
    pub fn matches(&self, value: &ReplayValue) -> bool {
        value.is_expired(self.0)
    }
}

/// Cluster-shared map of message id to [`ReplayValue`]
#[async_trait]
pub trait DistributedMap: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<ReplayValue>>;

    /// Store `value` if `key` is absent or its current value satisfies
    /// `expired`. Returns false when a live entry is already present.
    ///
    /// At most one concurrent caller per key gets `true`.
    async fn put_if_absent_or_expired(
        &self,
        key: &str,
        value: ReplayValue,
        ttl: Duration,
        expired: ExpiredBefore,
    ) -> Result<bool>;

    /// Overwrite the entry with `value` only if it still holds `expected`,
    /// keeping its time to live. Returns whether the write happened.
    async fn replace(&self, key: &str, expected: ReplayValue, value: ReplayValue) -> Result<bool>;

    async fn get_all_keys(&self) -> Result<Vec<String>>;

    async fn is_empty(&self) -> Result<bool>;

    /// Tear down and re-establish the backend connection
    async fn restart(&mut self) -> Result<()>;

    /// True for errors that warrant a backend restart
    fn is_transient_error(&self, err: &ClusterError) -> bool {
        matches!(err, ClusterError::BackendTimeout(_))
    }

    /// Drop entries expired at `now`; backends with native TTLs do nothing
    async fn evict_expired(&self, _now: i64) -> Result<u64> {
        Ok(0)
    }

    /// Addresses of the nodes sharing this map, where the backend knows them
    async fn member_addresses(&self) -> Vec<String> {
        Vec::new()
    }
}
