//! imcache - Cache-aside consistency engine
//!
//! This library keeps a shared Redis cache consistent with an authoritative
//! store for the data domains of a messaging server:
//! - Read-through `get_or_fetch` / `get_or_fetch_many` with fetch closures
//! - Single-flight misses, in-process and across processes (lease-bounded locks)
//! - Tombstones for confirmed-absent records, with their own shorter TTL
//! - Deferred, composable invalidation committed after the store write
//! - Order-independent fingerprints of identifier sets
//! - Optional in-process L1 layer with Redis pub/sub invalidation
//!
//! Domain adapters such as [`ConversationCache`] hold a [`CacheEngine`] and a
//! store adapter; they return [`PendingInvalidation`] units from their delete
//! methods instead of deleting right away.

mod backend;
mod batch;
mod config;
pub mod conversation;
mod engine;
mod entry;
mod error;
mod fingerprint;
mod flight;
mod invalidation;
mod key;
mod local_cache;
mod memory_backend;
mod redis_backend;
mod telemetry;

pub use backend::{CacheBackend, lock_key};
pub use batch::BatchResult;
pub use config::{CacheConfig, LocalCacheConfig};
pub use conversation::{Conversation, ConversationCache, ConversationStore};
pub use engine::CacheEngine;
pub use entry::{Cacheable, Envelope};
pub use error::{BoxError, CacheError, SharedError};
pub use fingerprint::fingerprint;
pub use invalidation::PendingInvalidation;
pub use key::CacheKey;
pub use memory_backend::MemoryBackend;
pub use redis_backend::RedisBackend;

// Re-export async_trait for implementors of the backend and store traits
pub use async_trait::async_trait;
