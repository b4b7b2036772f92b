//! In-process cache backend
//!
//! Implements the full [`CacheBackend`] protocol, lock records included, on a
//! mutex-guarded map. Expiry follows `tokio::time`, so tests running with a
//! paused clock can advance past TTLs deterministically. Several engines
//! sharing one `Arc<MemoryBackend>` behave like several processes sharing one
//! Redis.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::CacheError;
use crate::backend::{CacheBackend, STALE_SUFFIX};

struct Slot {
    value: Vec<u8>,
    expires_at: Instant,
}

struct LockRecord {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    values: HashMap<String, Slot>,
    locks: HashMap<String, LockRecord>,
}

impl State {
    fn live_value(&mut self, key: &str, now: Instant) -> Option<&Slot> {
        if self.values.get(key).is_some_and(|slot| slot.expires_at <= now) {
            self.values.remove(key);
        }
        self.values.get(key)
    }

    fn live_lock(&mut self, key: &str, now: Instant) -> Option<&mut LockRecord> {
        if self.locks.get(key).is_some_and(|lock| lock.expires_at <= now) {
            self.locks.remove(key);
        }
        self.locks.get_mut(key)
    }
}

/// In-memory [`CacheBackend`]
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call fail with `CacheError::Backend`, simulating an outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// True if `key` holds an unexpired entry.
    pub async fn contains(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        state.live_value(key, Instant::now()).is_some()
    }

    /// True if a live lock record exists for `key`.
    pub async fn is_locked(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        state.live_lock(key, Instant::now()).is_some()
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .values
            .values()
            .filter(|slot| slot.expires_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Backend(Arc::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory backend marked unavailable",
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state
            .live_value(key, Instant::now())
            .map(|slot| slot.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.values.insert(
            key.to_owned(),
            Slot {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        for key in keys {
            state.values.remove(key);
            if let Some(lock) = state.live_lock(key, now)
                && !lock.owner.ends_with(STALE_SUFFIX)
            {
                lock.owner.push_str(STALE_SUFFIX);
            }
        }
        Ok(())
    }

    async fn try_lock(
        &self,
        key: &str,
        token: &str,
        lease: Duration,
    ) -> Result<bool, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if state.live_lock(key, now).is_some() {
            return Ok(false);
        }
        state.locks.insert(
            key.to_owned(),
            LockRecord {
                owner: token.to_owned(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn set_locked(
        &self,
        key: &str,
        token: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let Some(lock) = state.live_lock(key, now) else {
            return Ok(false);
        };
        if lock.owner == token {
            state.locks.remove(key);
            state.values.insert(
                key.to_owned(),
                Slot {
                    value: value.to_vec(),
                    expires_at: now + ttl,
                },
            );
            return Ok(true);
        }
        if lock.owner.strip_suffix(STALE_SUFFIX) == Some(token) {
            state.locks.remove(key);
        }
        Ok(false)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let owned = state.live_lock(key, now).is_some_and(|lock| {
            lock.owner == token || lock.owner.strip_suffix(STALE_SUFFIX) == Some(token)
        });
        if owned {
            state.locks.remove(key);
        }
        Ok(owned)
    }
}
