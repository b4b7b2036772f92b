//! Order-independent fingerprints of identifier sets
//!
//! A client holding a copy of a set (e.g. its conversation ids) compares the
//! fingerprint it last saw with the current one instead of downloading the set.

use md5::{Digest, Md5};

const DELIMITER: &str = ";";

/// Fingerprint a set of identifiers.
///
/// The ids are sorted ascending, joined with `;` and MD5-hashed; the first
/// four digest bytes (eight hex digits) are read as a big-endian integer.
/// Input order never affects the result.
pub fn fingerprint<S: AsRef<str>>(ids: &[S]) -> u64 {
    let mut sorted: Vec<&str> = ids.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    let digest = Md5::digest(sorted.join(DELIMITER).as_bytes());
    u64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}
