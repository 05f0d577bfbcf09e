//! In-process counter store.
//!
//! Suitable for single-node deployments and tests. Counters live in a
//! concurrent map keyed by the full counter key; expiry is evaluated lazily
//! against the injected clock, so an expired entry reads as absent and is
//! reset by the next increment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::Clock;

use super::counter::{CounterStore, StoreError};

struct CounterEntry {
    value: i64,
    expires_at_nanos: i64,
}

/// A [`CounterStore`] backed by process memory.
pub struct InMemoryCounterStore {
    clock: Arc<dyn Clock>,
    counters: DashMap<String, CounterEntry>,
}

impl InMemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            counters: DashMap::new(),
        }
    }

    /// Drop entries whose TTL has elapsed.
    ///
    /// Reads already ignore expired entries; this only reclaims memory and
    /// can be called from a periodic housekeeping task.
    pub fn purge_expired(&self) {
        let now = self.clock.now_unix_nanos();
        self.counters.retain(|_, entry| entry.expires_at_nanos > now);
    }

    /// Number of live (non-expired) counters.
    pub fn len(&self) -> usize {
        let now = self.clock.now_unix_nanos();
        self.counters
            .iter()
            .filter(|entry| entry.expires_at_nanos > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let now = self.clock.now_unix_nanos();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry {
                value: 0,
                expires_at_nanos: now + ttl.as_nanos() as i64,
            });

        if entry.expires_at_nanos <= now {
            // Expired counter: the increment recreates it, so the TTL is
            // attached anew, matching store-side expiry semantics.
            entry.value = 1;
            entry.expires_at_nanos = now + ttl.as_nanos() as i64;
        } else {
            entry.value += 1;
        }

        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let now = self.clock.now_unix_nanos();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.expires_at_nanos > now)
            .map(|entry| entry.value)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, InMemoryCounterStore) {
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryCounterStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn incr_creates_and_accumulates() {
        let (_, store) = store();

        assert_eq!(store.incr("k", Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(store.incr("k", Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn get_missing_is_zero_not_error() {
        let (_, store) = store();
        assert_eq!(store.get("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_counter_reads_as_absent() {
        let (clock, store) = store();

        store.incr("k", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incr_after_expiry_restarts_at_one() {
        let (clock, store) = store();

        store.incr("k", Duration::from_secs(1)).await.unwrap();
        store.incr("k", Duration::from_secs(1)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.incr("k", Duration::from_secs(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ttl_is_set_on_create_only() {
        let (clock, store) = store();

        store.incr("k", Duration::from_secs(2)).await.unwrap();
        clock.advance(Duration::from_secs(1));
        // Second incr must not push the expiry out.
        store.incr("k", Duration::from_secs(2)).await.unwrap();
        clock.advance(Duration::from_millis(1_500));

        assert_eq!(store.get("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn purge_drops_only_expired() {
        let (clock, store) = store();

        store.incr("a", Duration::from_secs(1)).await.unwrap();
        store.incr("b", Duration::from_secs(10)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        store.purge_expired();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("b").await.unwrap(), 1);
    }
}
