//! Two-window interpolated rate limiter.
//!
//! Approximates a continuous sliding window with two adjacent fixed windows:
//! the current window's count plus the previous window's count weighted by its
//! temporal overlap. This smooths the burst-at-boundary flaw of naive fixed
//! windows without the bookkeeping cost of a sorted timestamp log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::clock::Clock;

use super::counter::{CounterStore, StoreError};
use super::{Decision, Key, LimiterFactory, RateLimiter};

/// Sliding-window [`RateLimiter`] over an atomic [`CounterStore`].
///
/// Holds no in-process lock; correctness under concurrent callers across
/// processes relies entirely on the store's atomicity. The host-side
/// arithmetic is pure and reentrant.
pub struct SlidingWindowRateLimiter {
    clock: Arc<dyn Clock>,
    counter: Arc<dyn CounterStore>,
    key_prefix: String,

    limit: u64,
    window: Duration,
}

impl SlidingWindowRateLimiter {
    /// Create a limiter for a `(limit, window)` pair.
    ///
    /// `window` should be non-zero; policy compilation enforces this for
    /// configured rules. A zero window passed directly is clamped to one
    /// nanosecond, since the window is the divisor of every decision.
    pub fn new(
        clock: Arc<dyn Clock>,
        counter: Arc<dyn CounterStore>,
        key_prefix: impl Into<String>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            clock,
            counter,
            key_prefix: key_prefix.into(),
            limit,
            window: window.max(Duration::from_nanos(1)),
        }
    }

    /// A [`LimiterFactory`] stamping out limiters that share one clock,
    /// store, and key prefix.
    pub fn factory(
        clock: Arc<dyn Clock>,
        counter: Arc<dyn CounterStore>,
        key_prefix: impl Into<String>,
    ) -> LimiterFactory {
        let key_prefix = key_prefix.into();
        Arc::new(move |limit, window| {
            Arc::new(SlidingWindowRateLimiter::new(
                clock.clone(),
                counter.clone(),
                key_prefix.clone(),
                limit,
                window,
            ))
        })
    }

    fn build_key(&self, key: &Key, window_idx: i64) -> String {
        format!("{}:{}:{}", self.key_prefix, key, window_idx)
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowRateLimiter {
    async fn allow(&self, key: &Key) -> Result<Decision, StoreError> {
        let now_ns = self.clock.now_unix_nanos();
        let window_ns = self.window.as_nanos() as i64;
        let current_idx = now_ns.div_euclid(window_ns);

        // TTL of two windows keeps the previous window's count alive for
        // interpolation, after which it expires naturally.
        let current_count = self
            .counter
            .incr(&self.build_key(key, current_idx), self.window * 2)
            .await?;
        let prev_count = self
            .counter
            .get(&self.build_key(key, current_idx - 1))
            .await?;

        // Missing or corrupted reads count as empty windows.
        let current_count = current_count.max(0) as u64;
        let prev_count = prev_count.max(0) as u64;

        // Clamp even though div_euclid puts us inside the window: the clock
        // may step backwards between the index computation and here.
        let window_start_ns = current_idx * window_ns;
        let elapsed_ns = (now_ns - window_start_ns).clamp(0, window_ns);
        let prev_weight_ns = (window_ns - elapsed_ns) as u64;

        let window_reset_in = Duration::from_nanos(prev_weight_ns);

        // All interpolation in 128-bit integers. Floating point loses
        // precision at high limit*window products and yields inconsistent
        // `remaining` values for near-identical consecutive requests close to
        // the boundary.
        //
        //   usage = current * window + prev * prev_weight
        //
        // compared against limit * window in the same unit.
        let window_ns_u = window_ns as u128;
        let usage =
            current_count as u128 * window_ns_u + prev_count as u128 * prev_weight_ns as u128;
        let budget = self.limit as u128 * window_ns_u;
        let allowed = usage <= budget;

        // used = ceil(usage / window), saturating instead of wrapping if the
        // quotient ever exceeds u64. Denying gracefully beats crashing.
        let used_requests_ceil: u64 = usage
            .div_ceil(window_ns_u)
            .try_into()
            .unwrap_or(u64::MAX);

        let remaining = self.limit.saturating_sub(used_requests_ceil);

        trace!(
            key = %key,
            window_idx = current_idx,
            current = current_count,
            previous = prev_count,
            allowed,
            remaining,
            "sliding window decision"
        );

        Ok(Decision {
            allowed,
            remaining,
            limit: self.limit,
            window: self.window,
            window_reset_in,
            retry_after: if allowed {
                Duration::ZERO
            } else {
                window_reset_in
            },
        })
    }
}
