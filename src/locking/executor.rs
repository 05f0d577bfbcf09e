//! Lock-guarded task execution.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::locker::{DistributedLocker, LockError};
use super::{ExecuteError, LockConfiguration};

/// Execution context handed to a lock-guarded task.
///
/// The token is cancelled when the task's deadline (`lock_at_most_for`)
/// elapses or the lock is lost externally. The executor never aborts the task
/// future; the task cooperates by observing the token.
#[derive(Debug, Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl TaskContext {
    /// Completes when the task should stop (deadline exceeded or lock lost).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The instant at which `lock_at_most_for` elapses, if configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The raw token, for composing with `tokio::select!` or child tokens.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Runs tasks under a distributed lock: "at most one node executes this job
/// at a time".
///
/// The executor is reentrant and holds no shared mutable state beyond the
/// injected locker; for concurrent jobs, call [`execute`](Self::execute)
/// concurrently. The task runs synchronously within the call, it is not
/// spawned onto a separate task.
///
/// Cancelling the caller (dropping the `execute` future) aborts whatever
/// phase is in progress; the lock, if already acquired, is still released by
/// the guard's drop.
#[derive(Clone)]
pub struct LockingTaskExecutor {
    locker: Arc<dyn DistributedLocker>,
    wait_for_lock: bool,
    acquire_timeout: Option<Duration>,
    name_prefix: String,
}

impl LockingTaskExecutor {
    /// New executor in try-once mode with no name prefix.
    pub fn new(locker: Arc<dyn DistributedLocker>) -> Self {
        Self {
            locker,
            wait_for_lock: false,
            acquire_timeout: None,
            name_prefix: String::new(),
        }
    }

    /// Block waiting for the lock (`true`) instead of trying once and
    /// reporting [`ExecuteError::NotAcquired`] (`false`, the default).
    pub fn wait_for_lock(mut self, wait: bool) -> Self {
        self.wait_for_lock = wait;
        self
    }

    /// Bound the blocking wait for the lock. Only meaningful with
    /// [`wait_for_lock`](Self::wait_for_lock).
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Prefix applied to every lock name, to namespace locks per
    /// environment or application (`"app:"` + `"cleanup"` → `"app:cleanup"`).
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Acquire the configured lock and run `task` under it.
    ///
    /// Semantics:
    /// * `lock_at_least_for > 0`: the lock is held for at least that duration
    ///   from when the task started, even if the task returns early, unless
    ///   the lock is lost or the caller is cancelled first.
    /// * `lock_at_most_for > 0`: the task's [`TaskContext`] carries that
    ///   deadline and is cancelled when it elapses.
    /// * The lock is released on every exit path, including task panics; the
    ///   panic itself propagates to the caller.
    pub async fn execute<F, Fut>(
        &self,
        cfg: LockConfiguration,
        task: F,
    ) -> Result<(), ExecuteError>
    where
        F: FnOnce(TaskContext) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        validate(&cfg)?;

        let lock_name = format!("{}{}", self.name_prefix, cfg.name);

        debug!(
            lock.name = %lock_name,
            lock.at_most_for = ?cfg.lock_at_most_for,
            lock.at_least_for = ?cfg.lock_at_least_for,
            lock.wait_for_lock = self.wait_for_lock,
            "attempting to acquire lock"
        );

        let acquire_started = Instant::now();
        let guard = if self.wait_for_lock {
            let acquire = self.locker.acquire(&lock_name);
            let acquired = match self.acquire_timeout {
                Some(timeout) => tokio::time::timeout(timeout, acquire)
                    .await
                    .map_err(ExecuteError::AcquireTimeout)?,
                None => acquire.await,
            };
            acquired.map_err(map_lock_error)?
        } else {
            match self.locker.try_acquire(&lock_name).await {
                Ok(Some(guard)) => guard,
                Ok(None) => {
                    info!(lock.name = %lock_name, "lock not acquired (held by another node)");
                    return Err(ExecuteError::NotAcquired);
                }
                Err(err) => return Err(map_lock_error(err)),
            }
        };

        info!(
            lock.name = %lock_name,
            lock.acquire_latency = ?acquire_started.elapsed(),
            "lock acquired"
        );

        let task_start = Instant::now();

        // The task token is a child of the guard's: lock loss cancels the
        // task; the deadline cancels only the task, never the guard.
        let cancel = guard.token().child_token();
        let deadline = (cfg.lock_at_most_for > Duration::ZERO)
            .then(|| task_start + cfg.lock_at_most_for);

        let deadline_timer = deadline.map(|at| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(at).await;
                cancel.cancel();
            })
        });

        let result = task(TaskContext {
            cancel: cancel.clone(),
            deadline,
        })
        .await;

        if let Some(timer) = deadline_timer {
            timer.abort();
        }

        let task_duration = task_start.elapsed();
        match &result {
            Ok(()) => info!(lock.name = %lock_name, task.duration = ?task_duration, "task finished"),
            Err(err) => warn!(
                lock.name = %lock_name,
                task.duration = ?task_duration,
                task.error = %err,
                "task finished with error"
            ),
        }

        // Hold the lock until lock_at_least_for has elapsed from task start,
        // so a fast-failing task does not cause another node to immediately
        // re-run the job. Lock loss shortens the wait; release happens
        // regardless.
        if cfg.lock_at_least_for > Duration::ZERO {
            let min_hold_until = task_start + cfg.lock_at_least_for;
            if Instant::now() < min_hold_until {
                debug!(
                    lock.name = %lock_name,
                    lock.remaining_hold = ?(min_hold_until - Instant::now()),
                    "enforcing lock_at_least_for"
                );
                tokio::select! {
                    _ = tokio::time::sleep_until(min_hold_until) => {}
                    _ = guard.token().cancelled() => {
                        warn!(lock.name = %lock_name, "lock lost during minimum hold");
                    }
                }
            }
        }

        drop(guard);
        result.map_err(ExecuteError::Task)
    }
}

fn map_lock_error(err: LockError) -> ExecuteError {
    match err {
        LockError::Closed => ExecuteError::LockerClosed,
        other => ExecuteError::Acquire(other),
    }
}

fn validate(cfg: &LockConfiguration) -> Result<(), ExecuteError> {
    if cfg.name.is_empty() {
        return Err(ExecuteError::InvalidConfiguration(
            "lock name must not be empty".to_string(),
        ));
    }
    if cfg.lock_at_most_for > Duration::ZERO && cfg.lock_at_least_for > cfg.lock_at_most_for {
        return Err(ExecuteError::InvalidConfiguration(format!(
            "lock_at_least_for ({:?}) exceeds lock_at_most_for ({:?})",
            cfg.lock_at_least_for, cfg.lock_at_most_for
        )));
    }
    Ok(())
}
