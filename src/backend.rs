//! Cache backend protocol
//!
//! The engine talks to the shared cache through [`CacheBackend`]. Besides plain
//! get/set/delete, a backend provides the per-key lock used for cross-process
//! single-flight:
//!
//! - `try_lock` claims the lock record for a key with a self-expiring lease.
//! - `set_locked` writes a fetched value only if the caller still owns the
//!   lock, then releases it. The check and write are atomic.
//! - `delete` removes keys and marks any live lock on them stale, so a fetch
//!   that started before the deletion cannot write its result back.

use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

/// Suffix appended to a lock owner's token once the key it guards was deleted.
pub(crate) const STALE_SUFFIX: &str = ":stale";

/// Lock record name for a cache key.
///
/// The key is wrapped in a Redis Cluster hash tag so that the lock always lives
/// in the same slot as the key it guards.
pub fn lock_key(key: &str) -> String {
    format!("{{{key}}}:lock")
}

/// Operations the engine needs from a shared key/value cache.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    /// Read the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Delete `keys`, marking live locks on them stale. Absent keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;

    /// Claim the lock for `key` with `token` if nobody holds it.
    async fn try_lock(&self, key: &str, token: &str, lease: Duration)
    -> Result<bool, CacheError>;

    /// Store `value` and release the lock if `token` still owns it.
    ///
    /// Returns `false` when the lease expired or the key was deleted meanwhile;
    /// nothing is written then, but a stale lock owned by `token` is released.
    async fn set_locked(
        &self,
        key: &str,
        token: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Release the lock for `key` if `token` owns it (stale or not).
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError>;

    /// Broadcast `payload` to other instances. Backends without pub/sub ignore it.
    async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), CacheError> {
        Ok(())
    }
}
