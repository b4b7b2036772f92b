//! In-process request coalescing
//!
//! Concurrent misses for one key inside a process join a single flight: the
//! first caller leads, the rest wait on a watch channel for the encoded
//! outcome. Cross-process exclusion is layered on top by the engine's lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tracing::debug;

use crate::CacheError;

/// Outcome shared with followers: the encoded envelope, or the leader's error.
pub(crate) type FlightResult = Result<Arc<[u8]>, CacheError>;

type FlightReceiver = watch::Receiver<Option<FlightResult>>;
type FlightSender = watch::Sender<Option<FlightResult>>;
type FlightMap = Arc<RwLock<HashMap<String, (u64, FlightReceiver)>>>;

/// Role assigned to a caller joining a flight.
pub(crate) enum Join {
    Leader(FlightGuard),
    Follower(FlightReceiver),
}

#[derive(Default)]
pub(crate) struct Flights {
    in_flight: FlightMap,
    next_id: AtomicU64,
}

impl Flights {
    /// Join the flight for `key`, starting one if none is running.
    ///
    /// A flight whose leader was dropped counts as not running, so the caller
    /// takes it over.
    pub(crate) async fn join(&self, key: &str) -> Join {
        {
            let in_flight = self.in_flight.read().await;
            if let Some((_, rx)) = in_flight.get(key)
                && !is_abandoned(rx)
            {
                return Join::Follower(rx.clone());
            }
        }

        let mut in_flight = self.in_flight.write().await;
        // Another task may have started a flight while we waited for the write lock
        if let Some((_, rx)) = in_flight.get(key)
            && !is_abandoned(rx)
        {
            return Join::Follower(rx.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        in_flight.insert(key.to_owned(), (id, rx));
        Join::Leader(FlightGuard {
            key: key.to_owned(),
            id,
            in_flight: Arc::clone(&self.in_flight),
            tx: Some(tx),
        })
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.in_flight.read().await.len()
    }
}

fn is_abandoned(rx: &FlightReceiver) -> bool {
    matches!(&*rx.borrow(), Some(Err(CacheError::FlightAbandoned(_))))
}

/// Wait for the leader's outcome for at most `timeout`.
pub(crate) async fn wait(key: &str, mut rx: FlightReceiver, timeout: Duration) -> FlightResult {
    debug!("Waiting for in-flight fetch for key: {}", key);
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::FlightAbandoned(key.to_owned()));
            }
        }
    })
    .await;

    outcome.unwrap_or_else(|_| {
        Err(CacheError::LockTimeout {
            key: key.to_owned(),
            waited: timeout,
        })
    })
}

/// Held by the leader of a flight.
///
/// Dropping it without `complete` (cancellation or panic) wakes followers with
/// `FlightAbandoned` and removes the flight.
pub(crate) struct FlightGuard {
    key: String,
    id: u64,
    in_flight: FlightMap,
    tx: Option<FlightSender>,
}

impl FlightGuard {
    /// Publish the outcome to followers and end the flight.
    pub(crate) async fn complete(mut self, result: FlightResult) {
        remove_flight(&self.in_flight, &self.key, self.id).await;
        if let Some(tx) = self.tx.take() {
            tx.send_replace(Some(result));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        tx.send_replace(Some(Err(CacheError::FlightAbandoned(self.key.clone()))));

        if let Ok(mut guard) = self.in_flight.try_write() {
            if guard.get(&self.key).is_some_and(|(current, _)| *current == self.id) {
                guard.remove(&self.key);
            }
            return;
        }
        let key = std::mem::take(&mut self.key);
        let id = self.id;
        let in_flight = Arc::clone(&self.in_flight);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                remove_flight(&in_flight, &key, id).await;
            });
        }
    }
}

async fn remove_flight(in_flight: &FlightMap, key: &str, id: u64) {
    let mut guard = in_flight.write().await;
    if guard.get(key).is_some_and(|(current, _)| *current == id) {
        guard.remove(key);
    }
}
