//! Deterministic cache keys

use std::fmt;

/// A cache key: a namespace prefix followed by one or more identifiers.
///
/// Identifiers after the prefix are joined with `-`, so
/// `CacheKey::build("CONVERSATION:", &["u1", "c1"])` is `CONVERSATION:u1-c1`.
/// The same logical identity always yields the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a namespace prefix and its identifiers.
    pub fn build(prefix: &str, ids: &[&str]) -> Self {
        let len = prefix.len() + ids.iter().map(|id| id.len() + 1).sum::<usize>();
        let mut key = String::with_capacity(len);
        key.push_str(prefix);
        for (i, id) in ids.iter().enumerate() {
            if i > 0 {
                key.push('-');
            }
            key.push_str(id);
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.to_owned())
    }
}
