//! Distributed mutual exclusion against an external key-value store.
//!
//! Implements the lock capability described in `spec.md` §4.4/§9: atomic
//! "set if absent with TTL", "get current value", and a value-checked
//! delete that guards against releasing a lock that expired and was
//! reacquired by someone else (P4 in §8).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::error::ManagerError;

/// Fixed process-wide key the mutex lives under (I3: single lock).
pub const LOCK_KEY: &str = "gpu-arbiter:lock";

/// Compare-and-delete script: only deletes if the stored value still
/// matches the caller's, so a stale lease can never clobber a fresh one.
const RELEASE_IF_MATCH_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

/// Capability for acquiring and releasing the external mutex.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Atomically sets `key` to `value` with `ttl_s`, only if absent.
    /// Returns `true` on success.
    async fn acquire(&self, key: &str, value: &str, ttl_s: u64) -> Result<bool, ManagerError>;

    /// Returns the current holder's value, if the key exists.
    async fn current_holder(&self, key: &str) -> Result<Option<String>, ManagerError>;

    /// Remaining TTL in seconds, or `None` if the key is absent or has no
    /// expiry recorded (the latter would violate I3 and is treated as absent).
    async fn ttl_remaining(&self, key: &str) -> Result<Option<i64>, ManagerError>;

    /// Deletes `key` only if its current value equals `value`. Returns
    /// `true` iff the delete happened.
    async fn release_if_value_equals(&self, key: &str, value: &str) -> Result<bool, ManagerError>;

    /// Unconditionally deletes `key`. Used by the operator recovery
    /// endpoint (`POST /gpu/lock/release`). Returns `true` iff a key was
    /// actually removed.
    async fn force_release(&self, key: &str) -> Result<bool, ManagerError>;
}

/// Redis-backed implementation of [`DistributedLock`].
pub struct RedisLock {
    manager: ConnectionManager,
}

impl RedisLock {
    /// Connects to `redis_url`, using a `ConnectionManager` so transient
    /// connection loss doesn't require callers to handle reconnection.
    pub async fn connect(redis_url: &str) -> Result<Self, ManagerError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, value: &str, ttl_s: u64) -> Result<bool, ManagerError> {
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_s)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn current_holder(&self, key: &str) -> Result<Option<String>, ManagerError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<i64>, ManagerError> {
        let mut conn = self.manager.clone();
        let ttl: i64 = conn.ttl(key).await?;
        Ok(if ttl >= 0 { Some(ttl) } else { None })
    }

    async fn release_if_value_equals(&self, key: &str, value: &str) -> Result<bool, ManagerError> {
        let mut conn = self.manager.clone();
        let script = redis::Script::new(RELEASE_IF_MATCH_SCRIPT);
        let deleted: i64 = script.key(key).arg(value).invoke_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool, ManagerError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }
}
