//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;
use serde_json::Value;

/// Longest key accepted over HTTP.
pub const MAX_KEY_LEN: usize = 250;

/// Most keys accepted by one bulk read.
pub const MAX_BULK_KEYS: usize = 1000;

/// Request body for the SET operation (PUT /set)
///
/// A JSON string `value` is stored raw; any other JSON value is stored
/// serialized and comes back with its original shape.
#[derive(Debug, Clone, Deserialize)]
pub struct SetRequest {
    /// The cache key
    pub key: String,
    /// The value to store
    pub value: Value,
    /// Optional TTL in seconds; absent or 0 never expires
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl SetRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        validate_key(&self.key)
    }
}

/// Request body for the bulk read (POST /bulk)
#[derive(Debug, Clone, Deserialize)]
pub struct BulkRequest {
    pub keys: Vec<String>,
}

impl BulkRequest {
    pub fn validate(&self) -> Option<String> {
        if self.keys.len() > MAX_BULK_KEYS {
            return Some(format!(
                "Bulk read exceeds maximum of {} keys",
                MAX_BULK_KEYS
            ));
        }
        self.keys.iter().find_map(|key| validate_key(key))
    }
}

/// Query string of the clean operation (DELETE /clean)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanQuery {
    /// Key prefix to remove; absent or empty removes everything
    #[serde(default)]
    pub prefix: String,
}

/// Checks the HTTP-level key rules. Backends apply their own on top.
pub fn validate_key(key: &str) -> Option<String> {
    if key.is_empty() {
        return Some("Key cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LEN {
        return Some(format!(
            "Key exceeds maximum length of {} characters",
            MAX_KEY_LEN
        ));
    }
    None
}
