//! Error types for the cache storage layer
//!
//! Provides unified error handling using thiserror. Per-key storage
//! operations never surface these to callers; they are logged and turned
//! into misses or no-ops at the `Storage` boundary. Construction and the
//! HTTP front-end are the places where they escape.

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for the cache storage layer.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key not found in cache (or expired)
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key cannot be mapped onto the backing store
    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Base directory missing and could not be created, or not writable
    #[error("Directory '{}' not found or not writable", path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem or socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk record could not be decoded
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Value or metadata (de)serialization failure
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// SQLite backend failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Distributed backend replied with something unexpected
    #[error("Remote store error: {0}")]
    Remote(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::InvalidRequest(_) | CacheError::InvalidKey { .. } => {
                StatusCode::BAD_REQUEST
            }
            CacheError::Codec(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache storage layer.
pub type Result<T> = std::result::Result<T, CacheError>;
