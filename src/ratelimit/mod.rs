//! Rate limiting core: decision types, the limiter contract, and the
//! sliding-window implementation.
//!
//! Limits here are time-based ("100 requests per 60 seconds"), not
//! count-based ("last N events"). Correctness across processes relies on the
//! atomicity of the backing [`CounterStore`], never on in-process locking.

mod counter;
mod memory;
mod sliding_window;

pub use counter::{CounterStore, StoreError};
pub use memory::InMemoryCounterStore;
pub use sliding_window::SlidingWindowRateLimiter;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// An opaque identifier for a rate-limit subject.
///
/// Typically derived from request metadata: a client address, a user id, an
/// API key. The limiter imposes no structure beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(String);

impl Key {
    /// Wrap an identifier as a rate-limit key.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The outcome of one admission decision.
///
/// Invariants: `remaining <= limit`, `window_reset_in <= window`, and
/// `retry_after` is zero exactly when `allowed` is true (a design decision of
/// this crate, not a law of rate limiting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Maximum requests allowed per window.
    pub limit: u64,
    /// Configured window size.
    pub window: Duration,
    /// Time until the current fixed window ends.
    pub window_reset_in: Duration,
    /// When a denied client may retry; zero when allowed.
    pub retry_after: Duration,
}

/// A time-based rate limiter bound to a `(limit, window)` pair.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Decide whether one more request for `key` is admitted, recording the
    /// request in the same step.
    ///
    /// An `Err` means the decision could not be made (e.g. the counter
    /// backend is unreachable); callers must treat that as a server-side
    /// failure, not as "rate limited".
    async fn allow(&self, key: &Key) -> Result<Decision, StoreError>;
}

/// Builds a [`RateLimiter`] for a `(limit, window)` pair.
///
/// Policy compilation uses this to stamp out one limiter per configured rule
/// while sharing the same store and clock.
pub type LimiterFactory = Arc<dyn Fn(u64, Duration) -> Arc<dyn RateLimiter> + Send + Sync>;
