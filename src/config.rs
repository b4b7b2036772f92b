//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// Configuration for the cache-aside engine
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL domain adapters use for positive entries
    pub default_ttl: Duration,
    /// Upper bound on the TTL of tombstones (confirmed-absent records)
    pub negative_ttl: Duration,
    /// Expiry of a single-flight lock record, independent of the caller
    pub lock_lease: Duration,
    /// Longest a caller waits on another caller's fetch before `LockTimeout`
    pub lock_wait_timeout: Duration,
    /// Pause between lock and cache re-checks while waiting
    pub lock_poll_interval: Duration,
    /// Identities resolved concurrently by `get_or_fetch_many`
    pub batch_concurrency: usize,
    /// Keys deleted per backend round trip when committing invalidations
    pub invalidate_batch_size: usize,
    /// Extra attempts for a failed delete chunk
    pub invalidate_retries: u32,
    /// Pause between delete attempts
    pub retry_interval: Duration,
    /// Optional in-process L1 layer
    pub local: Option<LocalCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(12 * 60 * 60), // 12 hours
            negative_ttl: Duration::from_secs(60),
            lock_lease: Duration::from_secs(3),
            lock_wait_timeout: Duration::from_secs(3),
            lock_poll_interval: Duration::from_millis(50),
            batch_concurrency: 16,
            invalidate_batch_size: 100,
            invalidate_retries: 3,
            retry_interval: Duration::from_millis(100),
            local: None,
        }
    }
}

impl CacheConfig {
    /// Enable the in-process L1 layer
    pub fn with_local(mut self, local: LocalCacheConfig) -> Self {
        self.local = Some(local);
        self
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.default_ttl.is_zero() || self.negative_ttl.is_zero() {
            return Err(CacheError::InvalidTtl);
        }
        if self.lock_lease.is_zero() {
            return Err(CacheError::InvalidConfig("lock_lease must be greater than zero"));
        }
        if self.lock_wait_timeout.is_zero() {
            return Err(CacheError::InvalidConfig(
                "lock_wait_timeout must be greater than zero",
            ));
        }
        if self.lock_poll_interval.is_zero() {
            return Err(CacheError::InvalidConfig(
                "lock_poll_interval must be greater than zero",
            ));
        }
        if self.batch_concurrency == 0 {
            return Err(CacheError::InvalidConfig(
                "batch_concurrency must be at least 1",
            ));
        }
        if self.invalidate_batch_size == 0 {
            return Err(CacheError::InvalidConfig(
                "invalidate_batch_size must be at least 1",
            ));
        }
        if let Some(local) = &self.local
            && local.ttl.is_zero()
        {
            return Err(CacheError::InvalidTtl);
        }
        Ok(())
    }
}

/// Configuration for the in-process L1 layer
#[derive(Debug, Clone)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held in memory
    pub max_capacity: u64,
    /// Time-to-live for L1 entries; bounds peer staleness if pub/sub is lost
    pub ttl: Duration,
    /// Redis pub/sub channel carrying invalidated keys
    pub topic: String,
    /// Publish invalidations to, and receive them from, other instances
    pub enable_pubsub: bool,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            ttl: Duration::from_secs(30),
            topic: "imcache:invalidate".to_owned(),
            enable_pubsub: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(
            CacheConfig::default()
                .with_local(LocalCacheConfig::default())
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_rejects_zero_values() {
        let config = CacheConfig {
            negative_ttl: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidTtl)));

        let config = CacheConfig {
            batch_concurrency: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(_))
        ));

        let config = CacheConfig {
            lock_wait_timeout: Duration::ZERO,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CacheError::InvalidConfig(msg)) if msg.contains("lock_wait_timeout")
        ));

        let config = CacheConfig::default().with_local(LocalCacheConfig {
            ttl: Duration::ZERO,
            ..LocalCacheConfig::default()
        });
        assert!(matches!(config.validate(), Err(CacheError::InvalidTtl)));
    }
}
