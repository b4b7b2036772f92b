//! Per-identity results of a batch lookup

use tracing::debug;

use crate::CacheError;

/// Results of [`CacheEngine::get_or_fetch_many`](crate::CacheEngine::get_or_fetch_many),
/// one per requested identity, in request order.
#[derive(Debug)]
pub struct BatchResult<I, V> {
    entries: Vec<(I, Result<V, CacheError>)>,
}

impl<I, V> BatchResult<I, V> {
    pub(crate) fn new(entries: Vec<(I, Result<V, CacheError>)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&I, &Result<V, CacheError>)> {
        self.entries.iter().map(|(id, result)| (id, result))
    }

    /// Number of identities whose lookup did not produce a value.
    pub fn failed(&self) -> usize {
        self.entries.iter().filter(|(_, r)| r.is_err()).count()
    }

    pub fn into_inner(self) -> Vec<(I, Result<V, CacheError>)> {
        self.entries
    }

    /// All values, or `PartialBatchFailure` if any identity failed (not-found included).
    pub fn into_values(self) -> Result<Vec<V>, CacheError> {
        let total = self.entries.len();
        let failed = self.failed();
        if failed > 0 {
            return Err(CacheError::PartialBatchFailure { failed, total });
        }
        Ok(self
            .entries
            .into_iter()
            .filter_map(|(_, r)| r.ok())
            .collect())
    }

    /// Values of the identities that exist, skipping confirmed-absent ones.
    ///
    /// Any other failure yields `PartialBatchFailure`.
    pub fn into_found(self) -> Result<Vec<V>, CacheError> {
        let total = self.entries.len();
        let mut values = Vec::with_capacity(total);
        let mut failed = 0;
        for (_, result) in self.entries {
            match result {
                Ok(value) => values.push(value),
                Err(CacheError::NotFound) => {}
                Err(e) => {
                    debug!("Batch lookup failed: {}", e);
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(CacheError::PartialBatchFailure { failed, total });
        }
        Ok(values)
    }
}
