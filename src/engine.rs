//! Generic cache-aside engine
//!
//! Read path for one key:
//! 1. L1 (optional, in-process)
//! 2. shared backend; a tombstone there is a cached "not found"
//! 3. on miss, join the in-process flight for the key; the leader takes the
//!    backend lock, re-checks the cache, runs the fetch closure and writes the
//!    result back only if it still owns the lock
//!
//! Callers that find the lock held by another process poll the cache until
//! the value appears or `lock_wait_timeout` elapses.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backend::CacheBackend;
use crate::batch::BatchResult;
use crate::entry::{self, Cacheable};
use crate::error::BoxError;
use crate::flight::{self, FlightResult, Flights, Join};
use crate::invalidation::PendingInvalidation;
use crate::local_cache::LocalCache;
use crate::redis_backend::RedisBackend;
use crate::telemetry::{self, Fetch, Lookup};
use crate::{CacheConfig, CacheError, CacheKey};

/// Cache-aside engine shared by every domain adapter.
///
/// Cloning is cheap; clones share the backend, the in-flight map and the L1.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    flights: Flights,
    local: Option<LocalCache>,
    subscriber: Option<JoinHandle<()>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.subscriber.take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("config", &self.inner.config)
            .field("local", &self.inner.local.is_some())
            .finish_non_exhaustive()
    }
}

enum Acquired {
    Locked,
    Cached(Vec<u8>),
}

impl CacheEngine {
    /// Create an engine over any backend. No pub/sub subscriber is started.
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Result<Self, CacheError> {
        Self::build(backend, config, None)
    }

    /// Create an engine over Redis.
    ///
    /// With an L1 layer and pub/sub enabled, a task is spawned that applies
    /// invalidations published by other instances; it stops when the last
    /// clone of the engine is dropped.
    pub async fn connect(client: redis::Client, config: CacheConfig) -> Result<Self, CacheError> {
        let backend = RedisBackend::new(client.clone()).await?;
        Self::build(Arc::new(backend), config, Some(client))
    }

    fn build(
        backend: Arc<dyn CacheBackend>,
        config: CacheConfig,
        client: Option<redis::Client>,
    ) -> Result<Self, CacheError> {
        config.validate()?;
        let local = config.local.as_ref().map(LocalCache::new);
        let subscriber = match (&local, client) {
            (Some(local), Some(client)) if local.topic().is_some() => {
                Some(local.spawn_subscriber(client))
            }
            _ => None,
        };
        Ok(Self {
            inner: Arc::new(EngineInner {
                backend,
                config,
                flights: Flights::default(),
                local,
                subscriber,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// An empty invalidation unit bound to this engine.
    pub fn pending(&self) -> PendingInvalidation {
        PendingInvalidation::new(self.clone())
    }

    /// Return the cached value for `key`, or fetch, cache and return it.
    ///
    /// `fetch` returns `Ok(None)` when the store confirms the record does not
    /// exist; a tombstone is then cached and `CacheError::NotFound` returned.
    /// Errors from `fetch` are returned as `StoreUnavailable` and cache nothing.
    /// Among concurrent callers for one key, `fetch` runs at most once.
    pub async fn get_or_fetch<V, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, CacheError>
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        let key = key.as_str();
        let epoch = self.inner.local.as_ref().map_or(0, LocalCache::epoch);

        if let Some(local) = &self.inner.local
            && let Some(bytes) = local.get(key).await
        {
            debug!("Cache hit L1 for key: {}", key);
            telemetry::lookup(Lookup::LocalHit);
            return entry::decode(key, &bytes);
        }

        if let Some(bytes) = self.inner.backend.get(key).await? {
            return self.cached(key, bytes, ttl, epoch).await;
        }
        debug!("Cache miss for key: {}", key);
        telemetry::lookup(Lookup::Miss);

        // One wait budget covers following, taking over and lock polling.
        let started = Instant::now();
        let deadline = started + self.inner.config.lock_wait_timeout;
        let outcome = loop {
            match self.inner.flights.join(key).await {
                Join::Leader(guard) => {
                    let outcome = self.lead(key, ttl, fetch, started, epoch).await;
                    guard.complete(outcome.clone()).await;
                    break outcome;
                }
                Join::Follower(rx) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match flight::wait(key, rx, remaining).await {
                        Err(CacheError::FlightAbandoned(_)) if !remaining.is_zero() => {
                            debug!("Leader for key {} was cancelled; taking over", key);
                        }
                        outcome => break outcome,
                    }
                }
            }
        };

        if matches!(outcome, Err(CacheError::LockTimeout { .. })) {
            telemetry::lock_timeout();
        }
        entry::decode(key, &outcome?)
    }

    /// Batch variant of [`get_or_fetch`](Self::get_or_fetch).
    ///
    /// Every identity goes through the single-key protocol independently, so a
    /// failure for one does not affect the others. `fetch` runs once per
    /// missing identity. The result holds one entry per element of `ids`, in
    /// order.
    pub async fn get_or_fetch_many<I, V, K, F, Fut>(
        &self,
        ids: &[I],
        ttl: Duration,
        key_of: K,
        fetch: F,
    ) -> Result<BatchResult<I, V>, CacheError>
    where
        I: Clone,
        V: Cacheable,
        K: Fn(&I) -> CacheKey,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        if ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        let key_of = &key_of;
        let fetch = &fetch;
        let entries = stream::iter(ids.iter().cloned())
            .map(|id| {
                let key = key_of(&id);
                let arg = id.clone();
                async move {
                    let result = self.get_or_fetch(&key, ttl, move || fetch(arg)).await;
                    (id, result)
                }
            })
            .buffered(self.inner.config.batch_concurrency)
            .collect::<Vec<_>>()
            .await;
        Ok(BatchResult::new(entries))
    }

    /// Delete `keys` from the cache (and L1), broadcasting to peers.
    ///
    /// A fetch in flight for one of the keys keeps serving its own callers
    /// but can no longer write its result back. Deleting absent keys is fine.
    pub async fn invalidate(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_str().to_owned()).collect();

        self.inner.backend.delete(&keys).await?;
        telemetry::invalidated(keys.len());

        if let Some(local) = &self.inner.local {
            local.invalidate(&keys).await;
            if let Some(topic) = local.topic() {
                // Best effort: peers fall back to the L1 TTL.
                match serde_json::to_string(&keys) {
                    Ok(payload) => {
                        if let Err(e) = self.inner.backend.publish(topic, &payload).await {
                            warn!("Failed to publish invalidation on {}: {}. Continuing.", topic, e);
                        }
                    }
                    Err(e) => warn!("Failed to encode invalidation payload: {}", e),
                }
            }
        }

        debug!("Invalidated {} keys", keys.len());
        Ok(())
    }

    /// Serve an entry found in the shared backend.
    ///
    /// The L1 copy lives no longer than the entry could have been written with.
    async fn cached<V: Cacheable>(
        &self,
        key: &str,
        bytes: Vec<u8>,
        ttl: Duration,
        epoch: u64,
    ) -> Result<V, CacheError> {
        let result = entry::decode::<V>(key, &bytes);
        let local_ttl = match &result {
            Ok(_) => {
                debug!("Cache hit for key: {}", key);
                telemetry::lookup(Lookup::Hit);
                ttl
            }
            Err(CacheError::NotFound) => {
                debug!("Cache hit (tombstone) for key: {}", key);
                telemetry::lookup(Lookup::Tombstone);
                ttl.min(self.inner.config.negative_ttl)
            }
            Err(e) => {
                warn!("Corrupt cache entry for key {}: {}. Deleting it.", key, e);
                if let Err(del_err) = self.inner.backend.delete(&[key.to_owned()]).await {
                    warn!("Failed to delete corrupt entry for key {}: {}", key, del_err);
                }
                return result;
            }
        };
        if let Some(local) = &self.inner.local {
            local.insert(key, Arc::from(bytes), local_ttl, epoch).await;
        }
        result
    }

    /// Run the cross-process part of a miss as the in-process leader.
    async fn lead<V, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
        started: Instant,
        epoch: u64,
    ) -> FlightResult
    where
        V: Cacheable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let token = Uuid::new_v4().to_string();
        match self.acquire(key, &token, started).await? {
            Acquired::Cached(bytes) => return Ok(Arc::from(bytes)),
            Acquired::Locked => {}
        }
        let lock = LockGuard::new(Arc::clone(&self.inner.backend), key, &token);

        // The previous lock holder may have filled the key after our miss.
        if let Some(bytes) = self.inner.backend.get(key).await? {
            lock.release().await;
            return Ok(Arc::from(bytes));
        }

        let (bytes, entry_ttl) = match fetch().await {
            Ok(Some(value)) => {
                telemetry::fetch(Fetch::Ok);
                match entry::encode_value(key, &value) {
                    Ok(bytes) => (bytes, ttl),
                    Err(e) => {
                        lock.release().await;
                        return Err(e);
                    }
                }
            }
            Ok(None) => {
                debug!("Record not found for key: {}", key);
                telemetry::fetch(Fetch::NotFound);
                (
                    entry::encode_tombstone(),
                    ttl.min(self.inner.config.negative_ttl),
                )
            }
            Err(e) => {
                error!("Store error for key {}: {}", key, e);
                telemetry::fetch(Fetch::Error);
                lock.release().await;
                return Err(CacheError::store(e));
            }
        };

        let bytes: Arc<[u8]> = Arc::from(bytes);
        match self
            .inner
            .backend
            .set_locked(key, &token, &bytes, entry_ttl)
            .await
        {
            Ok(true) => {
                lock.disarm();
                if let Some(local) = &self.inner.local {
                    local.insert(key, Arc::clone(&bytes), entry_ttl, epoch).await;
                }
            }
            Ok(false) => {
                lock.disarm();
                warn!(
                    "Fetched value for key {} not cached: lock lease expired or key was invalidated",
                    key
                );
            }
            Err(e) => {
                // Best effort: the caller still gets the fetched value.
                warn!("Cache write for key {} failed: {}. Continuing.", key, e);
            }
        }
        Ok(bytes)
    }

    /// Take the fetch lock for `key`, or return the value another holder cached.
    ///
    /// Gives up `lock_wait_timeout` after `started`.
    async fn acquire(
        &self,
        key: &str,
        token: &str,
        started: Instant,
    ) -> Result<Acquired, CacheError> {
        let config = &self.inner.config;
        loop {
            if self
                .inner
                .backend
                .try_lock(key, token, config.lock_lease)
                .await?
            {
                return Ok(Acquired::Locked);
            }

            let waited = started.elapsed();
            if waited >= config.lock_wait_timeout {
                warn!("Gave up waiting for fetch lock on {} after {:?}", key, waited);
                return Err(CacheError::LockTimeout {
                    key: key.to_owned(),
                    waited,
                });
            }
            tokio::time::sleep(
                config
                    .lock_poll_interval
                    .min(config.lock_wait_timeout - waited),
            )
            .await;

            if let Some(bytes) = self.inner.backend.get(key).await? {
                debug!("Value for key {} cached by another holder", key);
                return Ok(Acquired::Cached(bytes));
            }
        }
    }
}

/// Releases a held fetch lock if the leader is dropped mid-fetch.
///
/// The lease bounds the lock's lifetime regardless; this only frees it sooner.
struct LockGuard {
    backend: Arc<dyn CacheBackend>,
    key: String,
    token: String,
    armed: bool,
}

impl LockGuard {
    fn new(backend: Arc<dyn CacheBackend>, key: &str, token: &str) -> Self {
        Self {
            backend,
            key: key.to_owned(),
            token: token.to_owned(),
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.backend.unlock(&self.key, &self.token).await {
            warn!("Failed to release fetch lock on {}: {}", self.key, e);
        }
    }

    /// The lock was consumed by `set_locked`.
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = backend.unlock(&key, &token).await {
                    warn!("Failed to release abandoned fetch lock on {}: {}", key, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use tokio::sync::Notify;

    use super::*;
    use crate::{LocalCacheConfig, MemoryBackend};

    const TTL: Duration = Duration::from_secs(600);

    fn engine(backend: &Arc<MemoryBackend>, config: CacheConfig) -> CacheEngine {
        CacheEngine::new(Arc::clone(backend) as Arc<dyn CacheBackend>, config).unwrap()
    }

    fn found(value: &str) -> Result<Option<String>, BoxError> {
        Ok(Some(value.to_owned()))
    }

    fn missing() -> Result<Option<String>, BoxError> {
        Ok(None)
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    #[tokio::test]
    async fn test_second_read_is_served_from_cache() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: String = engine
                .get_or_fetch(&key("k"), TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    found("v")
                })
                .await
                .unwrap();
            assert_eq!(value, "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.contains("k").await);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            found(&format!("v{n}"))
        };

        let first: String = engine.get_or_fetch(&key("k"), TTL, fetch).await.unwrap();
        engine.invalidate(&[key("k")]).await.unwrap();
        assert!(!backend.contains("k").await);

        let second: String = engine.get_or_fetch(&key("k"), TTL, fetch).await.unwrap();
        assert_eq!(first, "v0");
        assert_eq!(second, "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Deleting absent keys is fine.
        engine.invalidate(&[key("k"), key("never")]).await.unwrap();
        engine.invalidate(&[]).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_fetch_once() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let calls = AtomicUsize::new(0);
        let hot = key("hot");

        let mut pending = Vec::new();
        for _ in 0..16 {
            pending.push(engine.get_or_fetch(&hot, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                found("v")
            }));
        }
        let results = join_all(pending).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let value: String = result.unwrap();
            assert_eq!(value, "v");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_across_engines_fetch_once() {
        // Two engines over one backend behave like two processes over one Redis.
        let backend = MemoryBackend::new();
        let engines: Vec<_> = (0..3)
            .map(|_| engine(&backend, CacheConfig::default()))
            .collect();
        let calls = AtomicUsize::new(0);
        let hot = key("hot");

        let mut pending = Vec::new();
        for engine in &engines {
            for _ in 0..4 {
                pending.push(engine.get_or_fetch(&hot, TTL, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(120)).await;
                    found("v")
                }));
            }
        }
        let results = join_all(pending).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.into_iter().all(|r: Result<String, _>| r.unwrap() == "v"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_share_the_error() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let calls = AtomicUsize::new(0);
        let k = key("k");

        let mut pending = Vec::new();
        for _ in 0..5 {
            pending.push(engine.get_or_fetch(&k, TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<Option<String>, BoxError>("db timeout".into())
            }));
        }
        let results = join_all(pending).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert!(matches!(result, Err(CacheError::StoreUnavailable(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_cached_until_tombstone_expires() {
        let backend = MemoryBackend::new();
        let config = CacheConfig {
            negative_ttl: Duration::from_secs(30),
            ..CacheConfig::default()
        };
        let engine = engine(&backend, config);
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            missing()
        };

        let first = engine.get_or_fetch(&key("ghost"), TTL, fetch).await;
        let second = engine.get_or_fetch(&key("ghost"), TTL, fetch).await;
        assert!(first.unwrap_err().is_not_found());
        assert!(second.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let third = engine.get_or_fetch(&key("ghost"), TTL, fetch).await;
        assert!(third.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tombstone_ttl_never_exceeds_entry_ttl() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let short = Duration::from_secs(5);

        let result = engine
            .get_or_fetch(&key("ghost"), short, || async { missing() })
            .await;
        assert!(result.unwrap_err().is_not_found());
        assert!(backend.contains("ghost").await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!backend.contains("ghost").await);
    }

    #[tokio::test]
    async fn test_transient_error_is_not_cached() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());

        let failed = engine
            .get_or_fetch(&key("k"), TTL, || async {
                Err::<Option<String>, BoxError>("connection reset".into())
            })
            .await;
        assert!(matches!(failed, Err(CacheError::StoreUnavailable(_))));
        assert!(!backend.contains("k").await);
        assert!(!backend.is_locked("k").await);

        let value: String = engine
            .get_or_fetch(&key("k"), TTL, || async { found("v") })
            .await
            .unwrap();
        assert_eq!(value, "v");
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let result = engine
            .get_or_fetch(&key("k"), Duration::ZERO, || async { found("v") })
            .await;
        assert!(matches!(result, Err(CacheError::InvalidTtl)));

        let batch = engine
            .get_or_fetch_many(&["a"], Duration::ZERO, |id| key(id), |_| async {
                found("v")
            })
            .await;
        assert!(matches!(batch, Err(CacheError::InvalidTtl)));
    }

    #[tokio::test]
    async fn test_batch_failure_is_isolated() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let ids = ["c1", "c2", "c3", "c4", "c5"];
        let calls = AtomicUsize::new(0);

        let batch = engine
            .get_or_fetch_many(
                &ids,
                TTL,
                |id| CacheKey::build("CONVERSATION:", &["u1", *id]),
                |id| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if id == "c3" {
                            Err("shard offline".into())
                        } else {
                            found(&format!("conv-{id}"))
                        }
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.failed(), 1);
        let order: Vec<_> = batch.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, ids);
        for (id, result) in batch.iter() {
            match *id {
                "c3" => assert!(matches!(result, Err(CacheError::StoreUnavailable(_)))),
                other => assert_eq!(result.as_ref().unwrap(), &format!("conv-{other}")),
            }
        }

        // The four successes were cached; only the failed one is fetched again.
        let retry = engine
            .get_or_fetch_many(
                &ids,
                TTL,
                |id| CacheKey::build("CONVERSATION:", &["u1", *id]),
                |id| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { found(&format!("conv-{id}")) }
                },
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(retry.into_values().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_times_out_across_engines() {
        let backend = MemoryBackend::new();
        let config = CacheConfig {
            lock_wait_timeout: Duration::from_millis(200),
            lock_lease: Duration::from_secs(10),
            ..CacheConfig::default()
        };
        let slow = engine(&backend, config.clone());
        let waiter = engine(&backend, config);
        let k = key("k");

        let (slow_result, waiter_result) = tokio::join!(
            slow.get_or_fetch(&k, TTL, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                found("v")
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let started = Instant::now();
                let result = waiter
                    .get_or_fetch(&k, TTL, || async { found("never") })
                    .await;
                (result, started.elapsed())
            }
        );

        assert_eq!(slow_result.unwrap(), "v");
        let (result, elapsed) = waiter_result;
        assert!(matches!(result, Err(CacheError::LockTimeout { .. })));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_wait_times_out_in_process() {
        let backend = MemoryBackend::new();
        let config = CacheConfig {
            lock_wait_timeout: Duration::from_millis(200),
            ..CacheConfig::default()
        };
        let engine = engine(&backend, config);
        let k = key("k");

        let (slow_result, waiter_result) = tokio::join!(
            engine.get_or_fetch(&k, TTL, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                found("v")
            }),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                engine
                    .get_or_fetch::<String, _, _>(&k, TTL, || async { found("never") })
                    .await
            }
        );

        assert_eq!(slow_result.unwrap(), "v");
        assert!(matches!(
            waiter_result,
            Err(CacheError::LockTimeout { waited, .. }) if waited == Duration::from_millis(200)
        ));
    }

    #[tokio::test]
    async fn test_invalidation_during_fetch_prevents_write_back() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let started = Notify::new();
        let release = Notify::new();
        let k = key("k");

        let (stale, ()) = tokio::join!(
            engine.get_or_fetch(&k, TTL, || async {
                started.notify_one();
                release.notified().await;
                found("old")
            }),
            async {
                started.notified().await;
                engine.invalidate(std::slice::from_ref(&k)).await.unwrap();
                release.notify_one();
            }
        );

        // The in-flight caller still gets its value, but it was not cached.
        assert_eq!(stale.unwrap(), "old");
        assert!(!backend.contains("k").await);
        assert!(!backend.is_locked("k").await);

        let fresh: String = engine
            .get_or_fetch(&key("k"), TTL, || async { found("new") })
            .await
            .unwrap();
        assert_eq!(fresh, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_releases_lock() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            engine.get_or_fetch(&key("k"), TTL, || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                found("v")
            }),
        )
        .await;
        assert!(cancelled.is_err());

        // Let the guard's release task run.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!backend.is_locked("k").await);

        let value: String = engine
            .get_or_fetch(&key("k"), TTL, || async { found("v2") })
            .await
            .unwrap();
        assert_eq!(value, "v2");
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_surfaced_and_removed() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        backend.set("k", b"garbage", TTL).await.unwrap();

        let result = engine
            .get_or_fetch(&key("k"), TTL, || async { found("v") })
            .await;
        assert!(matches!(result, Err(CacheError::Decode { .. })));
        assert!(!backend.contains("k").await);
    }

    #[tokio::test]
    async fn test_backend_outage_is_surfaced() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        backend.set_unavailable(true);
        let calls = AtomicUsize::new(0);

        let result = engine
            .get_or_fetch(&key("k"), TTL, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                found("v")
            })
            .await;
        assert!(matches!(result, Err(CacheError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_local_layer_serves_and_invalidates() {
        let backend = MemoryBackend::new();
        let config = CacheConfig::default().with_local(LocalCacheConfig::default());
        let engine = engine(&backend, config);
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            found("v")
        };

        let _: String = engine.get_or_fetch(&key("k"), TTL, fetch).await.unwrap();
        // Remove the shared copy behind the engine's back: L1 still serves it.
        backend.delete(&["k".to_owned()]).await.unwrap();
        let cached: String = engine.get_or_fetch(&key("k"), TTL, fetch).await.unwrap();
        assert_eq!(cached, "v");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.invalidate(&[key("k")]).await.unwrap();
        let _: String = engine.get_or_fetch(&key("k"), TTL, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_copy_expires_with_entry_ttl() {
        let backend = MemoryBackend::new();
        let config = CacheConfig {
            negative_ttl: Duration::from_secs(10),
            ..CacheConfig::default()
        }
        .with_local(LocalCacheConfig::default());
        let engine = engine(&backend, config);
        let calls = AtomicUsize::new(0);
        let short = Duration::from_secs(5);
        let fetch = || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            found(&format!("v{n}"))
        };

        let first: String = engine.get_or_fetch(&key("k"), short, fetch).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!backend.contains("k").await);
        let second: String = engine.get_or_fetch(&key("k"), short, fetch).await.unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("v0", "v1"));

        // Tombstones leave L1 after min(negative_ttl, ttl).
        let ghost = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            missing()
        };
        let before = calls.load(Ordering::SeqCst);
        for _ in 0..2 {
            let result = engine.get_or_fetch(&key("ghost"), TTL, ghost).await;
            assert!(result.unwrap_err().is_not_found());
        }
        assert_eq!(calls.load(Ordering::SeqCst), before + 1);
        tokio::time::advance(Duration::from_secs(11)).await;
        let result = engine.get_or_fetch(&key("ghost"), TTL, ghost).await;
        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_copy_from_shared_hit_is_capped_by_caller_ttl() {
        let backend = MemoryBackend::new();
        let config = CacheConfig::default().with_local(LocalCacheConfig::default());
        let engine = engine(&backend, config);
        let short = Duration::from_secs(5);

        backend
            .set("k", &entry::encode_value("k", &"shared").unwrap(), TTL)
            .await
            .unwrap();
        let value: String = engine
            .get_or_fetch(&key("k"), short, || async { found("store") })
            .await
            .unwrap();
        assert_eq!(value, "shared");

        // Drop the shared copy; L1 must not outlive the caller's TTL.
        backend.delete(&["k".to_owned()]).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let value: String = engine
            .get_or_fetch(&key("k"), short, || async { found("store") })
            .await
            .unwrap();
        assert_eq!(value, "store");
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_when_leader_is_cancelled() {
        let backend = MemoryBackend::new();
        let engine = engine(&backend, CacheConfig::default());
        let calls = AtomicUsize::new(0);
        let k = key("k");
        let fetch = || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            found(&format!("v{n}"))
        };

        let (leader, follower) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(10), engine.get_or_fetch(&k, TTL, fetch)),
            async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                engine.get_or_fetch::<String, _, _>(&k, TTL, fetch).await
            }
        );

        assert!(leader.is_err());
        assert_eq!(follower.unwrap(), "v1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(backend.contains("k").await);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CacheConfig {
            lock_lease: Duration::ZERO,
            ..CacheConfig::default()
        };
        let result = CacheEngine::new(MemoryBackend::new(), config);
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }
}
