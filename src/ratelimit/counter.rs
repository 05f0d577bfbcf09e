//! Storage contract for distributed counters.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by a [`CounterStore`] backend.
///
/// Absence of a key is never an error; `get` reports it as `0`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("counter store connection error: {0}")]
    Connection(String),

    /// The backend rejected or failed the operation.
    #[error("counter store query error: {0}")]
    Query(String),
}

/// The storage abstraction the rate limiter counts against.
///
/// Both operations must be individually atomic under unbounded concurrent
/// callers across processes. All mutation is a single atomic increment, so no
/// compare-and-swap loop is required of implementations.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key` and return the new value.
    ///
    /// If this increment creates the counter (post-increment value is 1), an
    /// expiry of at least `ttl` must be attached in the same atomic step.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, StoreError>;

    /// Current value of the counter, or `0` if the key is absent.
    async fn get(&self, key: &str) -> Result<i64, StoreError>;
}
