//! Content fingerprints
//!
//! SHA-256 digests used to detect whether a resolved record changed since it
//! was last written, and to assign identity keys to merge shards in a way
//! that is stable across processes and runs.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of raw bytes
pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a value's JSON serialization.
///
/// Callers must pass values with deterministic serialization (ordered maps).
pub fn content_fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let encoded = serde_json::to_vec(value)?;
    Ok(fingerprint_bytes(&encoded))
}

/// Map a key onto one of `shards` buckets; always 0 when `shards <= 1`
pub fn stable_shard(key: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}
