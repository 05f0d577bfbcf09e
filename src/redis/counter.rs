//! Redis-backed counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::ratelimit::{CounterStore, StoreError};

// KEYS[1] = counter key, ARGV[1] = TTL in milliseconds.
// The TTL is only attached when the INCR created the key, so an existing
// counter expires on the schedule set at creation.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// A [`CounterStore`] backed by Redis.
///
/// Increments run a small Lua script so the increment and the TTL attachment
/// are one atomic step. Counters read as absent when expired or never
/// written, which the limiter treats as zero.
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: String,
    incr_script: Script,
}

impl RedisCounterStore {
    /// Wrap a connection manager as a counter store.
    ///
    /// `prefix` is optional; when non-empty, keys become `prefix:key`.
    pub fn new(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: normalize_prefix(prefix.into()),
            incr_script: Script::new(INCR_WITH_TTL),
        }
    }

    /// Connect to Redis at `url` and wrap the connection.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(manager, prefix))
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn normalize_prefix(mut prefix: String) -> String {
    if !prefix.is_empty() && !prefix.ends_with(':') {
        prefix.push(':');
    }
    prefix
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        self.incr_script
            .key(self.build_key(key))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();

        // GET on a missing key returns nil, which decodes as None.
        let value: Option<i64> = redis::cmd("GET")
            .arg(self.build_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(value.unwrap_or(0))
    }
}
