//! Redis-backed distributed locker.
//!
//! A lock is a single key written with `SET NX PX` and a random owner id. A
//! keepalive task extends the key while the guard lives and cancels the
//! guard's token if the extension fails, so a holder that loses its key
//! learns about it instead of running unfenced. Release and extension are
//! owner-checked Lua scripts; a node never deletes or extends a lock it no
//! longer owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::locking::{DistributedLocker, LockError, LockGuard};

// KEYS[1] = lock key, ARGV[1] = owner id.
const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS[1] = lock key, ARGV[1] = owner id, ARGV[2] = validity in milliseconds.
const EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Tunables for [`RedisLocker`].
#[derive(Debug, Clone)]
pub struct RedisLockerConfig {
    /// Prefix for lock keys; a trailing `:` is added when missing.
    pub key_prefix: String,
    /// How long a lock key lives without an extension. Bounds how long a
    /// lock stays stuck if its holder dies without releasing.
    pub validity: Duration,
    /// Base delay between attempts in a blocking acquire. A random jitter of
    /// up to half this value is added so contending nodes spread out.
    pub retry_interval: Duration,
}

impl Default for RedisLockerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
            validity: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// A [`DistributedLocker`] backed by Redis.
pub struct RedisLocker {
    manager: ConnectionManager,
    config: RedisLockerConfig,
    release_script: Arc<Script>,
    extend_script: Arc<Script>,
    closed: Arc<AtomicBool>,
}

impl RedisLocker {
    pub fn new(manager: ConnectionManager, mut config: RedisLockerConfig) -> Self {
        if !config.key_prefix.is_empty() && !config.key_prefix.ends_with(':') {
            config.key_prefix.push(':');
        }
        Self {
            manager,
            config,
            release_script: Arc::new(Script::new(RELEASE)),
            extend_script: Arc::new(Script::new(EXTEND)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Connect to Redis at `url` and wrap the connection.
    pub async fn connect(url: &str, config: RedisLockerConfig) -> Result<Self, LockError> {
        let client =
            redis::Client::open(url).map_err(|e| LockError::Backend(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self::new(manager, config))
    }

    /// Stop handing out locks. Outstanding guards keep their keepalives
    /// until dropped; only new acquisitions are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn build_key(&self, name: &str) -> String {
        format!("{}{}", self.config.key_prefix, name)
    }

    fn spawn_keepalive(&self, key: String, owner: String) -> (CancellationToken, CancellationToken) {
        let lost = CancellationToken::new();
        let stop = CancellationToken::new();

        let mut conn = self.manager.clone();
        let extend = self.extend_script.clone();
        let validity_ms = validity_millis(self.config.validity);
        let interval = self.config.validity / 3;
        let task_lost = lost.clone();
        let task_stop = stop.clone();

        let validity = self.config.validity;
        tokio::spawn(async move {
            let mut last_extended = Instant::now();
            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let extended: Result<i64, _> = extend
                    .key(&key)
                    .arg(&owner)
                    .arg(validity_ms)
                    .invoke_async(&mut conn)
                    .await;

                match extended {
                    Ok(1) => last_extended = Instant::now(),
                    Ok(_) => {
                        // Key expired or was taken over; the holder has lost
                        // the lock.
                        warn!(key = %key, "lock lost before release");
                        task_lost.cancel();
                        return;
                    }
                    Err(err) => {
                        // A transient failure leaves the key with validity
                        // remaining and the next tick retries. Once a full
                        // validity passes without a successful extension the
                        // key has expired server-side and the lock is gone,
                        // whether or not the backend is answering yet.
                        if lease_expired(last_extended, validity) {
                            warn!(
                                key = %key,
                                error = %err,
                                "lock lost: no extension within validity"
                            );
                            task_lost.cancel();
                            return;
                        }
                        warn!(key = %key, error = %err, "lock keepalive failed");
                    }
                }
            }
        });

        (lost, stop)
    }
}

#[async_trait]
impl DistributedLocker for RedisLocker {
    async fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }

        let key = self.build_key(name);
        let owner = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();

        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&owner)
            .arg("NX")
            .arg("PX")
            .arg(validity_millis(self.config.validity))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if set.is_none() {
            return Ok(None);
        }

        debug!(key = %key, owner = %owner, "lock acquired");

        let (lost, stop) = self.spawn_keepalive(key.clone(), owner.clone());
        let release_script = self.release_script.clone();
        let mut release_conn = self.manager.clone();

        Ok(Some(LockGuard::new(lost, move || {
            stop.cancel();
            // The release runs on the runtime since Drop cannot await. If the
            // runtime is already gone the key frees itself via its TTL.
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                return;
            };
            handle.spawn(async move {
                let released: Result<i64, _> = release_script
                    .key(&key)
                    .arg(&owner)
                    .invoke_async(&mut release_conn)
                    .await;
                if let Err(err) = released {
                    warn!(key = %key, error = %err, "lock release failed");
                }
            });
        })))
    }

    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        loop {
            if let Some(guard) = self.try_acquire(name).await? {
                return Ok(guard);
            }

            let delay = self.config.retry_interval + acquire_jitter(self.config.retry_interval);
            tokio::time::sleep(delay).await;
        }
    }
}

fn lease_expired(last_extended: Instant, validity: Duration) -> bool {
    last_extended.elapsed() >= validity
}

fn validity_millis(validity: Duration) -> i64 {
    i64::try_from(validity.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn acquire_jitter(base: Duration) -> Duration {
    let cap = base.as_millis() as u64 / 2;
    if cap == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = RedisLockerConfig::default();
        assert_eq!(config.key_prefix, "lock:");
        assert!(config.validity > config.retry_interval);
    }

    #[test]
    fn validity_is_clamped_to_at_least_one_millisecond() {
        assert_eq!(validity_millis(Duration::ZERO), 1);
        assert_eq!(validity_millis(Duration::from_secs(10)), 10_000);
        assert_eq!(validity_millis(Duration::from_secs(u64::MAX)), i64::MAX);
    }

    #[test]
    fn jitter_stays_within_half_the_base() {
        for _ in 0..32 {
            let jitter = acquire_jitter(Duration::from_millis(100));
            assert!(jitter <= Duration::from_millis(50));
        }
        assert_eq!(acquire_jitter(Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn unextended_lease_counts_as_lost_after_validity() {
        let validity = Duration::from_secs(10);
        let last_extended = Instant::now();

        // With validity remaining, an extend failure is transient.
        tokio::time::sleep(validity - Duration::from_secs(1)).await;
        assert!(!lease_expired(last_extended, validity));

        // Past the validity the key has expired server-side; the holder must
        // treat the lock as lost even though no extend has answered.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(lease_expired(last_extended, validity));
    }

    #[test]
    fn scripts_are_owner_checked() {
        assert!(RELEASE.contains("GET"));
        assert!(RELEASE.contains("DEL"));
        assert!(EXTEND.contains("PEXPIRE"));
    }
}
