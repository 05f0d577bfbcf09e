//! In-process locker.
//!
//! Gives single-node deployments and tests the same executor semantics as the
//! distributed backends. Blocking acquires park on a [`Notify`] and re-check
//! after every release, so there is no hand-off ordering guarantee, the same
//! as with a contended remote lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::locker::{DistributedLocker, LockError, LockGuard};

struct LockerInner {
    held: Mutex<HashMap<String, CancellationToken>>,
    released: Notify,
    closed: AtomicBool,
}

/// A [`DistributedLocker`] backed by process memory.
#[derive(Clone)]
pub struct InMemoryLocker {
    inner: Arc<LockerInner>,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockerInner {
                held: Mutex::new(HashMap::new()),
                released: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Shut the locker down.
    ///
    /// Outstanding guards have their lock-loss tokens cancelled and all
    /// subsequent calls fail with [`LockError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        for token in self.inner.held.lock().values() {
            token.cancel();
        }
        // Wake blocked acquirers so they observe the closed state.
        self.inner.released.notify_waiters();
    }

    /// Whether a lock with this exact name is currently held.
    pub fn is_held(&self, name: &str) -> bool {
        self.inner.held.lock().contains_key(name)
    }
}

impl Default for InMemoryLocker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLocker for InMemoryLocker {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }

        let mut held = self.inner.held.lock();
        if held.contains_key(name) {
            return Ok(None);
        }

        let token = CancellationToken::new();
        held.insert(name.to_string(), token.clone());
        drop(held);

        let inner = self.inner.clone();
        let name = name.to_string();
        Ok(Some(LockGuard::new(token, move || {
            inner.held.lock().remove(&name);
            inner.released.notify_waiters();
        })))
    }

    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        loop {
            // Register for the wakeup before checking, so a release between
            // the check and the await is not lost.
            let released = self.inner.released.notified();

            if let Some(guard) = self.try_acquire(name).await? {
                return Ok(guard);
            }

            released.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn try_acquire_is_exclusive() {
        let locker = InMemoryLocker::new();

        let guard = locker.try_acquire("job").await.unwrap();
        assert!(guard.is_some());
        assert!(locker.try_acquire("job").await.unwrap().is_none());

        // Different name is independent.
        assert!(locker.try_acquire("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn drop_releases() {
        let locker = InMemoryLocker::new();

        let guard = locker.try_acquire("job").await.unwrap().unwrap();
        assert!(locker.is_held("job"));
        drop(guard);
        assert!(!locker.is_held("job"));

        assert!(locker.try_acquire("job").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_released() {
        let locker = InMemoryLocker::new();
        let guard = locker.try_acquire("job").await.unwrap().unwrap();

        let contender = {
            let locker = locker.clone();
            tokio::spawn(async move { locker.acquire("job").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        let guard = contender.await.unwrap().unwrap();
        assert!(!guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn close_cancels_guards_and_rejects_calls() {
        let locker = InMemoryLocker::new();
        let guard = locker.try_acquire("job").await.unwrap().unwrap();

        locker.close();

        assert!(guard.token().is_cancelled());
        assert!(matches!(
            locker.try_acquire("job").await,
            Err(LockError::Closed)
        ));
        assert!(matches!(locker.acquire("job").await, Err(LockError::Closed)));
    }
}
