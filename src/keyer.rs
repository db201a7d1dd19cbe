//! Content-addressed cache keys for relay queries.
//!
//! The key is the SHA-256 of `json(relays) + ":" + json(filter) + ":" + mode`.
//! Serialization preserves the caller's ordering for both the relay list and
//! the filter's object keys, so logically equal queries written in a different
//! order hash to different keys.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest naming one (relays, filter, mode) query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the cache key for a query.
pub fn cache_key(relays: &[String], filter: &Value, single_event: bool) -> CacheKey {
    let material = format!("{}:{}:{}", Value::from(relays), filter, single_event);
    CacheKey(hex::encode(Sha256::digest(material.as_bytes())))
}
