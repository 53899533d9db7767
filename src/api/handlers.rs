//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint. Storage calls may
//! block on file locks or sockets, so every handler runs them on the
//! blocking thread pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::Value;

use crate::cache::Cache;
use crate::error::{CacheError, Result};
use crate::models::{
    validate_key, BulkRequest, BulkResponse, CleanQuery, CleanResponse, GetResponse,
    HealthResponse, KeyResponse, SetRequest, StatsResponse,
};
use crate::storage::{Backend, CacheValue};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Cache facade over the configured backend
    pub cache: Arc<Cache>,
    /// Backend behind `cache`, reported by /stats
    pub backend: Backend,
}

impl AppState {
    pub fn new(cache: Cache, backend: Backend) -> Self {
        Self {
            cache: Arc::new(cache),
            backend,
        }
    }
}

/// Runs a storage call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Internal(format!("storage task failed: {}", e)))?
}

/// Converts a stored value to JSON. Raw bytes become a (lossy) string.
fn to_json(cache: &Cache, value: CacheValue) -> Result<Value> {
    if value.serialized {
        cache.decode(value)
    } else {
        Ok(Value::String(
            String::from_utf8_lossy(&value.data).into_owned(),
        ))
    }
}

fn check_key(key: &str) -> Result<()> {
    match validate_key(key) {
        Some(msg) => Err(CacheError::InvalidRequest(msg)),
        None => Ok(()),
    }
}

/// Handler for PUT /set
///
/// A JSON string is stored raw; anything else is stored serialized.
pub async fn set_handler(
    State(state): State<AppState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<KeyResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let SetRequest { key, value, ttl } = req;
    let ttl = ttl.unwrap_or(0);
    let cache = state.cache.clone();

    let key = blocking(move || {
        match value {
            Value::String(text) => cache.set_raw(&key, text, ttl),
            other => cache.set(&key, &other, ttl)?,
        }
        Ok(key)
    })
    .await?;

    Ok(Json(KeyResponse::set(key)))
}

/// Handler for GET /get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    check_key(&key)?;
    let cache = state.cache.clone();

    blocking(move || {
        let value = cache
            .get_raw(&key)
            .ok_or_else(|| CacheError::NotFound(key.clone()))?;
        let serialized = value.serialized;
        let json = to_json(&cache, value)?;
        Ok(Json(GetResponse::new(key, json, serialized)))
    })
    .await
}

/// Handler for POST /bulk
pub async fn bulk_handler(
    State(state): State<AppState>,
    Json(req): Json<BulkRequest>,
) -> Result<Json<BulkResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    let cache = state.cache.clone();

    blocking(move || {
        let mut values = BTreeMap::new();
        for (key, value) in cache.get_many(&req.keys) {
            let json = match value {
                Some(value) => Some(to_json(&cache, value)?),
                None => None,
            };
            values.insert(key, json);
        }
        Ok(Json(BulkResponse { values }))
    })
    .await
}

/// Handler for DELETE /del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<KeyResponse>> {
    check_key(&key)?;
    let cache = state.cache.clone();

    blocking(move || {
        cache.remove(&key);
        Ok(Json(KeyResponse::deleted(key)))
    })
    .await
}

/// Handler for DELETE /clean?prefix=
pub async fn clean_handler(
    State(state): State<AppState>,
    Query(query): Query<CleanQuery>,
) -> Result<Json<CleanResponse>> {
    let cache = state.cache.clone();

    blocking(move || {
        cache.clean(&query.prefix);
        Ok(Json(CleanResponse::new(query.prefix)))
    })
    .await
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(
        state.backend.as_str(),
        &state.cache.stats(),
    ))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn test_state() -> AppState {
        AppState::new(Cache::new(Arc::new(MemoryStorage::new())), Backend::Memory)
    }

    fn set_req(key: &str, value: Value) -> SetRequest {
        SetRequest {
            key: key.to_string(),
            value,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn test_set_and_get_string() {
        let state = test_state();

        set_handler(State(state.clone()), Json(set_req("greeting", json!("hi"))))
            .await
            .unwrap();

        let response = get_handler(State(state.clone()), Path("greeting".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, json!("hi"));
        assert!(!response.serialized);
    }

    #[tokio::test]
    async fn test_set_and_get_structured() {
        let state = test_state();
        let value = json!({"user": "ada", "roles": ["admin"]});

        set_handler(State(state.clone()), Json(set_req("session", value.clone())))
            .await
            .unwrap();

        let response = get_handler(State(state), Path("session".to_string()))
            .await
            .unwrap();
        assert_eq!(response.value, value);
        assert!(response.serialized);
    }

    #[tokio::test]
    async fn test_get_nonexistent_key() {
        let result = get_handler(State(test_state()), Path("nonexistent".to_string())).await;
        assert!(matches!(result, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_handler() {
        let state = test_state();
        set_handler(State(state.clone()), Json(set_req("to_delete", json!("v"))))
            .await
            .unwrap();

        delete_handler(State(state.clone()), Path("to_delete".to_string()))
            .await
            .unwrap();

        let result = get_handler(State(state), Path("to_delete".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bulk_handler() {
        let state = test_state();
        set_handler(State(state.clone()), Json(set_req("a", json!(1))))
            .await
            .unwrap();

        let req = BulkRequest {
            keys: vec!["a".to_string(), "b".to_string()],
        };
        let response = bulk_handler(State(state), Json(req)).await.unwrap();
        assert_eq!(response.values["a"], Some(json!(1)));
        assert_eq!(response.values["b"], None);
    }

    #[tokio::test]
    async fn test_clean_handler() {
        let state = test_state();
        for key in ["user-1", "user-2", "post-1"] {
            set_handler(State(state.clone()), Json(set_req(key, json!("v"))))
                .await
                .unwrap();
        }

        let query = CleanQuery {
            prefix: "user-".to_string(),
        };
        clean_handler(State(state.clone()), Query(query)).await.unwrap();

        assert!(get_handler(State(state.clone()), Path("user-1".to_string())).await.is_err());
        assert!(get_handler(State(state), Path("post-1".to_string())).await.is_ok());
    }

    #[tokio::test]
    async fn test_stats_handler() {
        let state = test_state();
        let _ = get_handler(State(state.clone()), Path("missing".to_string())).await;

        let response = stats_handler(State(state)).await;
        assert_eq!(response.backend, "memory");
        assert_eq!(response.hits, 0);
        assert_eq!(response.misses, 1);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await;
        assert_eq!(response.status, "healthy");
    }

    #[tokio::test]
    async fn test_set_invalid_request() {
        let result = set_handler(State(test_state()), Json(set_req("", json!("v")))).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }
}
