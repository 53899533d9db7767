//! cachestore - Pluggable cache storage
//!
//! One storage contract (read, bulk read, lock, write, remove, clean) with
//! a file-locked on-disk backend, an in-process map, an SQLite table and a
//! memcached client, plus a typed cache facade and an HTTP front-end.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod storage;

pub use api::{create_router, AppState};
pub use cache::{Cache, CacheStats, JsonCodec, ValueCodec};
pub use config::Config;
pub use error::{CacheError, Result};
pub use storage::{
    Backend, BulkResult, CacheValue, FileStorage, MemcachedStorage, MemoryStorage,
    SqliteStorage, Storage,
};
