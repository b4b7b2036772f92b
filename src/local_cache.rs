//! Optional in-process L1 layer
//!
//! Holds encoded envelopes in a Moka cache. An entry lives no longer than the
//! TTL of the shared entry it copies, capped by the L1 TTL. Invalidations are
//! applied locally right away and broadcast over Redis pub/sub; a subscriber
//! task owned by the engine applies peers' invalidations. If a message is
//! lost, the L1 TTL bounds how long a peer can serve the old entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use moka::Expiry;
use moka::future::Cache;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::LocalCacheConfig;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct LocalEntry {
    bytes: Arc<[u8]>,
    ttl: Duration,
    expires_at: Instant,
}

/// Expires each entry after its own TTL instead of one cache-wide value.
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Clone)]
pub(crate) struct LocalCache {
    entries: Cache<String, LocalEntry>,
    /// Bumped by every invalidation, local or from a peer.
    epoch: Arc<AtomicU64>,
    max_ttl: Duration,
    topic: String,
    publish: bool,
}

impl LocalCache {
    pub(crate) fn new(config: &LocalCacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(EntryExpiry)
            .build();
        Self {
            entries,
            epoch: Arc::new(AtomicU64::new(0)),
            max_ttl: config.ttl,
            topic: config.topic.clone(),
            publish: config.enable_pubsub,
        }
    }

    /// Current invalidation epoch. Read it before the backend read whose
    /// result is later passed to [`insert`](Self::insert).
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) async fn get(&self, key: &str) -> Option<Arc<[u8]>> {
        let entry = self.entries.get(key).await?;
        if entry.expires_at <= Instant::now() {
            self.entries.invalidate(key).await;
            return None;
        }
        Some(entry.bytes)
    }

    /// Cache `bytes` for at most `ttl`, capped by the configured L1 TTL.
    ///
    /// `epoch` is the value of [`epoch`](Self::epoch) taken before the bytes
    /// were read. If any invalidation ran since, the entry is dropped again:
    /// either this check sees the new epoch, or the invalidation's own removal
    /// runs after the insert.
    pub(crate) async fn insert(&self, key: &str, bytes: Arc<[u8]>, ttl: Duration, epoch: u64) {
        let ttl = ttl.min(self.max_ttl);
        if ttl.is_zero() {
            return;
        }
        let entry = LocalEntry {
            bytes,
            ttl,
            expires_at: Instant::now() + ttl,
        };
        self.entries.insert(key.to_owned(), entry).await;
        if self.epoch() != epoch {
            debug!("Key {} was invalidated during its read; dropping L1 copy", key);
            self.entries.invalidate(key).await;
        }
    }

    pub(crate) async fn invalidate(&self, keys: &[String]) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            self.entries.invalidate(key).await;
        }
    }

    /// Channel to broadcast invalidations on, if pub/sub is enabled.
    pub(crate) fn topic(&self) -> Option<&str> {
        self.publish.then_some(self.topic.as_str())
    }

    /// Spawn the task applying invalidations published by other instances.
    pub(crate) fn spawn_subscriber(&self, client: redis::Client) -> JoinHandle<()> {
        tokio::spawn(subscribe_loop(client, self.clone()))
    }

    async fn apply_invalidation(&self, payload: &str) {
        match serde_json::from_str::<Vec<String>>(payload) {
            Ok(keys) => {
                self.invalidate(&keys).await;
                debug!("L1 invalidated {} keys from peer", keys.len());
            }
            Err(e) => warn!("Unable to parse invalidation payload {}: {}", payload, e),
        }
    }
}

async fn subscribe_loop(client: redis::Client, local: LocalCache) {
    let topic = local.topic.clone();
    let mut delay = INITIAL_BACKOFF;
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.subscribe(&topic).await {
                Ok(()) => {
                    debug!("Subscribed to invalidation topic {}", topic);
                    delay = INITIAL_BACKOFF;
                    let mut messages = pubsub.on_message();
                    while let Some(msg) = messages.next().await {
                        match msg.get_payload::<String>() {
                            Ok(payload) => local.apply_invalidation(&payload).await,
                            Err(e) => {
                                warn!("Failed to decode invalidation payload on {}: {}", topic, e);
                            }
                        }
                    }
                    warn!("Invalidation subscription on {} closed; reconnecting", topic);
                }
                Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
            },
            Err(e) => error!("Failed to open pub/sub connection: {}", e),
        }

        tokio::time::sleep(delay).await;
        delay = delay.saturating_mul(2).min(MAX_BACKOFF);
    }
}
