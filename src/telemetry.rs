//! Engine counters
//!
//! Emitted through the `metrics` facade; exporting them is the host's job.

use metrics::counter;

pub(crate) const LOOKUPS: &str = "imcache_lookups_total";
pub(crate) const FETCHES: &str = "imcache_fetches_total";
pub(crate) const LOCK_TIMEOUTS: &str = "imcache_lock_timeouts_total";
pub(crate) const INVALIDATED_KEYS: &str = "imcache_invalidated_keys_total";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Lookup {
    LocalHit,
    Hit,
    Tombstone,
    Miss,
}

impl Lookup {
    fn as_str(self) -> &'static str {
        match self {
            Self::LocalHit => "local_hit",
            Self::Hit => "hit",
            Self::Tombstone => "tombstone",
            Self::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Fetch {
    Ok,
    NotFound,
    Error,
}

impl Fetch {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::Error => "error",
        }
    }
}

pub(crate) fn lookup(result: Lookup) {
    counter!(LOOKUPS, "result" => result.as_str()).increment(1);
}

pub(crate) fn fetch(outcome: Fetch) {
    counter!(FETCHES, "outcome" => outcome.as_str()).increment(1);
}

pub(crate) fn lock_timeout() {
    counter!(LOCK_TIMEOUTS).increment(1);
}

pub(crate) fn invalidated(keys: usize) {
    counter!(INVALIDATED_KEYS).increment(keys as u64);
}
