//! Distributed mutual exclusion around units of work.
//!
//! The [`LockingTaskExecutor`] guarantees that, cluster-wide, at most one
//! node runs a given job at a time, with ShedLock-style minimum and maximum
//! hold durations. The lock itself is delegated to a [`DistributedLocker`]
//! backend; this module owns the lifecycle: acquisition mode, deadline
//! propagation, minimum-hold enforcement, and guaranteed release.

mod executor;
mod locker;
mod memory;

pub use executor::{LockingTaskExecutor, TaskContext};
pub use locker::{DistributedLocker, LockError, LockGuard};
pub use memory::InMemoryLocker;

use std::time::Duration;

use thiserror::Error;

/// Configuration for one lock-guarded task invocation.
///
/// * `name`: logical lock name (e.g. `"profile.cleanup"`); must be non-empty.
/// * `lock_at_most_for`: maximum time the task is allowed to run; enforced as
///   a deadline on the task's context. Zero disables the deadline.
/// * `lock_at_least_for`: minimum time the lock stays held once the task has
///   started, even if the task returns early. Zero disables the floor.
///
/// When both are non-zero, `lock_at_least_for` must not exceed
/// `lock_at_most_for`. Invalid configurations are rejected before any lock
/// attempt.
#[derive(Debug, Clone)]
pub struct LockConfiguration {
    pub name: String,
    pub lock_at_most_for: Duration,
    pub lock_at_least_for: Duration,
}

impl LockConfiguration {
    /// Configuration with the given name and no hold bounds.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lock_at_most_for: Duration::ZERO,
            lock_at_least_for: Duration::ZERO,
        }
    }

    pub fn lock_at_most_for(mut self, duration: Duration) -> Self {
        self.lock_at_most_for = duration;
        self
    }

    pub fn lock_at_least_for(mut self, duration: Duration) -> Self {
        self.lock_at_least_for = duration;
        self
    }
}

/// Failure taxonomy surfaced by [`LockingTaskExecutor::execute`].
#[derive(Error, Debug)]
pub enum ExecuteError {
    /// The lock is held by another node (try-once mode). Expected and
    /// recoverable; the steady state for all but one node in a cluster.
    #[error("lock not acquired (held by another node)")]
    NotAcquired,

    /// The [`LockConfiguration`] is invalid; reported before any I/O.
    #[error("invalid lock configuration: {0}")]
    InvalidConfiguration(String),

    /// The underlying locker is unusable, for this and likely further calls.
    #[error("locker is closed")]
    LockerClosed,

    /// Waiting for the lock exceeded the configured acquire timeout.
    #[error("timed out waiting for lock")]
    AcquireTimeout(#[source] tokio::time::error::Elapsed),

    /// Any other acquisition failure.
    #[error("failed to acquire lock: {0}")]
    Acquire(#[source] LockError),

    /// The task itself returned an error; the lock was still released.
    #[error("task failed: {0}")]
    Task(anyhow::Error),
}
