//! Deferred cache invalidation
//!
//! A write to the store is followed by removing every cache key it affects.
//! [`PendingInvalidation`] collects those keys without doing any I/O, possibly
//! across several domain calls, and deletes them in one explicit
//! [`commit`](PendingInvalidation::commit) issued after the store write is
//! durable.
//!
//! ```ignore
//! store.update_conversation(&conv).await?;
//! cache
//!     .del_conversations(&conv.owner_user_id, &[conv.conversation_id.as_str()])
//!     .merge(&cache.del_user_recv_msg_opt(&conv.owner_user_id, &conv.conversation_id))
//!     .commit()
//!     .await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{CacheEngine, CacheError, CacheKey};

/// An immutable, ordered set of keys slated for deletion.
///
/// `with` and `merge` return new units and leave the receiver untouched.
/// `commit` may be called any number of times; deleting an absent key is not
/// an error.
#[derive(Debug, Clone)]
#[must_use = "queued invalidations do nothing until `commit` is called"]
pub struct PendingInvalidation {
    engine: CacheEngine,
    keys: Arc<[CacheKey]>,
    /// Lengths of runs of `keys` that must be deleted in one backend call.
    groups: Arc<[usize]>,
}

impl PendingInvalidation {
    pub(crate) fn new(engine: CacheEngine) -> Self {
        Self {
            engine,
            keys: Arc::from(Vec::new()),
            groups: Arc::from(Vec::new()),
        }
    }

    /// A new unit holding this unit's keys followed by any new ones in `keys`.
    pub fn with<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<CacheKey>,
    {
        self.extend(keys.into_iter().map(|key| vec![key.into()]))
    }

    /// Like [`with`](Self::with), but the new keys are always deleted
    /// together, e.g. a list and the fingerprint derived from it.
    pub fn with_linked<I, K>(&self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<CacheKey>,
    {
        self.extend([keys.into_iter().map(Into::into).collect()])
    }

    /// A new unit holding the keys of both units.
    pub fn merge(&self, other: &Self) -> Self {
        self.extend(other.groups().map(<[CacheKey]>::to_vec))
    }

    fn extend(&self, groups: impl IntoIterator<Item = Vec<CacheKey>>) -> Self {
        let mut keys: Vec<CacheKey> = self.keys.to_vec();
        let mut lengths: Vec<usize> = self.groups.to_vec();
        let mut seen: HashSet<CacheKey> = keys.iter().cloned().collect();
        for group in groups {
            let before = keys.len();
            for key in group {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            if keys.len() > before {
                lengths.push(keys.len() - before);
            }
        }
        Self {
            engine: self.engine.clone(),
            keys: Arc::from(keys),
            groups: Arc::from(lengths),
        }
    }

    fn groups(&self) -> impl Iterator<Item = &[CacheKey]> {
        let mut start = 0;
        self.groups.iter().map(move |len| {
            let group = &self.keys[start..start + len];
            start += len;
            group
        })
    }

    /// Split the keys into chunks of at most `size`, never splitting a linked
    /// group. A group larger than `size` forms its own chunk.
    pub(crate) fn chunks(&self, size: usize) -> Vec<&[CacheKey]> {
        let mut chunks = Vec::new();
        let mut start = 0;
        let mut end = 0;
        for len in self.groups.iter() {
            if end > start && end - start + len > size {
                chunks.push(&self.keys[start..end]);
                start = end;
            }
            end += len;
        }
        if end > start {
            chunks.push(&self.keys[start..end]);
        }
        chunks
    }

    pub fn keys(&self) -> &[CacheKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Delete every queued key.
    ///
    /// Call only after the triggering store write has been applied. Keys are
    /// deleted in chunks of about `invalidate_batch_size`, each removed by one
    /// backend call; keys queued together with `with_linked` share a chunk.
    /// A chunk failing with a retryable error is retried up to
    /// `invalidate_retries` times.
    pub async fn commit(&self) -> Result<(), CacheError> {
        let config = self.engine.config();
        for chunk in self.chunks(config.invalidate_batch_size) {
            let mut attempt = 0u32;
            loop {
                match self.engine.invalidate(chunk).await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && attempt < config.invalidate_retries => {
                        attempt += 1;
                        warn!(
                            "Invalidation attempt {} of {} keys failed: {}. Retrying.",
                            attempt,
                            chunk.len(),
                            e
                        );
                        tokio::time::sleep(config.retry_interval).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        debug!("Committed invalidation of {} keys", self.keys.len());
        Ok(())
    }
}
