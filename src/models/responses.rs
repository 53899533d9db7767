//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::cache::CacheStats;

/// Response body for the GET operation (GET /get/:key)
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested key
    pub key: String,
    /// The stored value
    pub value: Value,
    /// Whether the value was stored serialized
    pub serialized: bool,
}

impl GetResponse {
    pub fn new(key: impl Into<String>, value: Value, serialized: bool) -> Self {
        Self {
            key: key.into(),
            value,
            serialized,
        }
    }
}

/// Response body for the bulk read (POST /bulk)
///
/// Every requested key is present; misses are `null`.
#[derive(Debug, Clone, Serialize)]
pub struct BulkResponse {
    pub values: BTreeMap<String, Option<Value>>,
}

/// Response body for the operations that only echo the key
/// (PUT /set, DELETE /del/:key)
#[derive(Debug, Clone, Serialize)]
pub struct KeyResponse {
    /// Success message
    pub message: String,
    /// The key acted on
    pub key: String,
}

impl KeyResponse {
    pub fn set(key: impl Into<String>) -> Self {
        Self::with_verb(key.into(), "set")
    }

    pub fn deleted(key: impl Into<String>) -> Self {
        Self::with_verb(key.into(), "deleted")
    }

    fn with_verb(key: String, verb: &str) -> Self {
        Self {
            message: format!("Key '{}' {} successfully", key, verb),
            key,
        }
    }
}

/// Response body for the clean operation (DELETE /clean)
#[derive(Debug, Clone, Serialize)]
pub struct CleanResponse {
    pub message: String,
    pub prefix: String,
}

impl CleanResponse {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let message = if prefix.is_empty() {
            "All keys removed".to_string()
        } else {
            format!("Keys starting with '{}' removed", prefix)
        };
        Self { message, prefix }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Storage backend in use
    pub backend: String,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of writes
    pub writes: u64,
    /// Number of removals
    pub removals: u64,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl StatsResponse {
    /// Creates a new StatsResponse from cache statistics
    pub fn new(backend: impl Into<String>, stats: &CacheStats) -> Self {
        Self {
            backend: backend.into(),
            hits: stats.hits,
            misses: stats.misses,
            writes: stats.writes,
            removals: stats.removals,
            hit_rate: stats.hit_rate(),
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_response_keeps_value_shape() {
        let resp = GetResponse::new("k", json!({"a": [1, 2]}), true);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["value"]["a"][1], 2);
        assert_eq!(json["serialized"], true);
    }

    #[test]
    fn test_key_response_messages() {
        assert!(KeyResponse::set("a").message.contains("set"));
        assert!(KeyResponse::deleted("a").message.contains("deleted"));
    }

    #[test]
    fn test_bulk_response_serializes_misses_as_null() {
        let mut values = BTreeMap::new();
        values.insert("hit".to_string(), Some(json!("v")));
        values.insert("miss".to_string(), None);
        let json = serde_json::to_value(BulkResponse { values }).unwrap();
        assert_eq!(json["values"]["hit"], "v");
        assert!(json["values"]["miss"].is_null());
    }

    #[test]
    fn test_clean_response_message() {
        assert_eq!(CleanResponse::new("").message, "All keys removed");
        assert!(CleanResponse::new("user-").message.contains("user-"));
    }

    #[test]
    fn test_stats_response_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            writes: 5,
            removals: 1,
        };
        let resp = StatsResponse::new("memory", &stats);
        assert!((resp.hit_rate - 0.8).abs() < 0.001);
        assert_eq!(resp.backend, "memory");
    }

    #[test]
    fn test_health_response_serialize() {
        let resp = HealthResponse::healthy();
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("timestamp"));
    }

    #[test]
    fn test_error_response_serialize() {
        let json = serde_json::to_string(&ErrorResponse::new("Something went wrong")).unwrap();
        assert!(json.contains("Something went wrong"));
    }
}
