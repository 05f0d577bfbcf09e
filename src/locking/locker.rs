//! Locker contract and the RAII lock guard.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors from a [`DistributedLocker`] backend.
#[derive(Error, Debug)]
pub enum LockError {
    /// The locker has been shut down and will not serve further calls.
    #[error("locker is closed")]
    Closed,

    /// The backend failed the operation.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A held distributed lock.
///
/// The guard releases the lock exactly once when dropped, on every exit path
/// including panic unwind. Its [`CancellationToken`] fires if the lock is
/// lost externally (backend outage, key deleted, keepalive failure); holders
/// doing lock-protected work should watch it.
pub struct LockGuard {
    token: CancellationToken,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Build a guard from a lock-loss token and a release action.
    ///
    /// `release` must be idempotent-safe to call once and must not block; an
    /// async backend release should be handed off (e.g. spawned) from it.
    pub fn new(token: CancellationToken, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            token,
            release: Some(Box::new(release)),
        }
    }

    /// Token that is cancelled when the lock is lost externally.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lock_lost", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A cluster-wide mutual exclusion primitive.
///
/// At most one guard exists per lock name at a time across all processes
/// sharing the backend.
#[async_trait]
pub trait DistributedLocker: Send + Sync {
    /// Attempt to acquire the lock once.
    ///
    /// Returns `Ok(None)` if the lock is currently held elsewhere; that is a
    /// normal branch, not an error.
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError>;

    /// Acquire the lock, waiting until it becomes available.
    ///
    /// Callers bound the wait by wrapping the future (e.g. in
    /// `tokio::time::timeout`) or by dropping it.
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;
}
