//! Redis cache backend
//!
//! Locks are `SET NX PX` records under [`lock_key`]. The compare-and-write and
//! delete-and-mark-stale steps run as Lua scripts so they are atomic on the
//! server. Each script touches a key and its lock, which share a hash slot.
//! A multi-key delete runs in one MULTI/EXEC, which needs a single-node (or
//! single-slot) deployment.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use tracing::debug;

use crate::CacheError;
use crate::backend::{CacheBackend, STALE_SUFFIX, lock_key};

/// KEYS[1] = key, KEYS[2] = lock;
/// ARGV[1] = token, ARGV[2] = value, ARGV[3] = ttl ms, ARGV[4] = stale suffix
const SET_LOCKED: &str = r"
local owner = redis.call('GET', KEYS[2])
if owner == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    redis.call('DEL', KEYS[2])
    return 1
end
if owner == ARGV[1] .. ARGV[4] then
    redis.call('DEL', KEYS[2])
end
return 0
";

/// KEYS[1] = key, KEYS[2] = lock; ARGV[1] = stale suffix
const DELETE_AND_MARK: &str = r"
redis.call('DEL', KEYS[1])
local owner = redis.call('GET', KEYS[2])
if owner and string.sub(owner, -string.len(ARGV[1])) ~= ARGV[1] then
    redis.call('SET', KEYS[2], owner .. ARGV[1], 'KEEPTTL')
end
return 1
";

/// KEYS[1] = lock; ARGV[1] = token, ARGV[2] = stale suffix
const UNLOCK: &str = r"
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[1] or owner == ARGV[1] .. ARGV[2] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

/// [`CacheBackend`] over a shared Redis deployment
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
    set_locked: Script,
    unlock: Script,
}

impl RedisBackend {
    /// Connect a managed (auto-reconnecting) connection.
    pub async fn new(client: redis::Client) -> Result<Self, CacheError> {
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: redis::aio::ConnectionManager) -> Self {
        Self {
            conn,
            set_locked: Script::new(SET_LOCKED),
            unlock: Script::new(UNLOCK),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.pset_ex::<_, _, ()>(key, value, millis(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        // One MULTI/EXEC: either every key of the call is deleted or none is.
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.cmd("EVAL")
                .arg(DELETE_AND_MARK)
                .arg(2)
                .arg(key)
                .arg(lock_key(key))
                .arg(STALE_SUFFIX)
                .ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;
        debug!("Redis deleted {} keys", keys.len());
        Ok(())
    }

    async fn try_lock(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_locked(
        &self,
        key: &str,
        token: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let written: i64 = self
            .set_locked
            .key(key)
            .key(lock_key(key))
            .arg(token)
            .arg(value)
            .arg(millis(ttl))
            .arg(STALE_SUFFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .unlock
            .key(lock_key(key))
            .arg(token)
            .arg(STALE_SUFFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}
