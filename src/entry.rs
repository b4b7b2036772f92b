//! Encoding of stored cache entries
//!
//! Every value written to the backend is wrapped in an envelope so that a
//! confirmed-absent record (tombstone) can be told apart from a missing key.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::CacheError;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A stored entry: a value, or a tombstone for a confirmed-absent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "s", content = "v", rename_all = "snake_case")]
pub enum Envelope<V> {
    Value(V),
    Tombstone,
}

#[derive(Serialize)]
#[serde(tag = "s", content = "v", rename_all = "snake_case")]
enum EnvelopeRef<'a, V> {
    Value(&'a V),
}

/// Encode a value envelope.
pub(crate) fn encode_value<V: Serialize>(key: &str, value: &V) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(&EnvelopeRef::Value(value)).map_err(|e| CacheError::encode(key, e))
}

/// Encode a tombstone.
pub(crate) fn encode_tombstone() -> Vec<u8> {
    br#"{"s":"tombstone"}"#.to_vec()
}

/// Decode an envelope; a tombstone becomes `CacheError::NotFound`.
pub(crate) fn decode<V: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<V, CacheError> {
    match serde_json::from_slice::<Envelope<V>>(bytes) {
        Ok(Envelope::Value(value)) => Ok(value),
        Ok(Envelope::Tombstone) => Err(CacheError::NotFound),
        Err(e) => Err(CacheError::decode(key, e)),
    }
}
