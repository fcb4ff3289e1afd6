//! Cache key derivation
//!
//! Origin identifiers (typically URLs) are arbitrary strings and not safe to
//! use as file names, so both tiers key entries by a SHA-256 digest of the
//! identifier instead.

use sha2::{Digest, Sha256};

/// Derive a filesystem-safe cache key from an origin identifier.
///
/// Deterministic and pure: the same identifier always yields the same
/// 64-character lowercase hex string.
pub fn cache_key(origin_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(origin_id.as_bytes());
    hex::encode(hasher.finalize())
}
