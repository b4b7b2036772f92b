//! Cache error types

use std::sync::Arc;
use std::time::Duration;

use redis::RedisError;

/// Boxed error returned by store adapters and fetch closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error shared between every caller of one coalesced fetch.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
///
/// The type is `Clone` so that callers coalesced onto one in-flight fetch all
/// observe the same outcome.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The cache backend could not be reached or rejected a command.
    #[error("cache backend error: {0}")]
    Backend(SharedError),

    /// The store failed transiently. Never cached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(SharedError),

    /// The store confirmed the record does not exist.
    #[error("record not found")]
    NotFound,

    /// Waiting on another caller's fetch exceeded the configured bound.
    #[error("timed out after {waited:?} waiting for the fetch lock on {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("failed to decode value for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: Arc<serde_json::Error>,
    },

    #[error("ttl must be greater than zero")]
    InvalidTtl,

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(&'static str),

    /// The in-process leader of a coalesced fetch was dropped before finishing.
    #[error("in-flight fetch for {0} was cancelled")]
    FlightAbandoned(String),

    /// Some identities of a batch failed while others succeeded.
    #[error("{failed} of {total} batch lookups failed")]
    PartialBatchFailure { failed: usize, total: usize },
}

impl CacheError {
    /// True for the definitive "record does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// True when retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Backend(_)
                | Self::StoreUnavailable(_)
                | Self::LockTimeout { .. }
                | Self::FlightAbandoned(_)
        )
    }

    pub(crate) fn store(err: BoxError) -> Self {
        Self::StoreUnavailable(Arc::from(err))
    }

    pub(crate) fn encode(key: &str, err: serde_json::Error) -> Self {
        Self::Encode {
            key: key.to_owned(),
            source: Arc::new(err),
        }
    }

    pub(crate) fn decode(key: &str, err: serde_json::Error) -> Self {
        Self::Decode {
            key: key.to_owned(),
            source: Arc::new(err),
        }
    }
}

impl From<RedisError> for CacheError {
    fn from(err: RedisError) -> Self {
        Self::Backend(Arc::new(err))
    }
}
