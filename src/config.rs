//! Configuration Module
//!
//! Loads server and backend configuration from environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::error::{CacheError, Result};
use crate::storage::{
    sqlite, Backend, FileStorage, MemcachedStorage, MemoryStorage, SqliteStorage, Storage,
};

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage backend to open
    pub backend: Backend,
    /// Base directory of the file backend
    pub cache_dir: PathBuf,
    /// Database path of the SQLite backend (`:memory:` for in-memory)
    pub sqlite_path: PathBuf,
    /// `host:port` of the memcached server
    pub memcached_addr: String,
    /// Namespace prepended to every memcached key
    pub key_prefix: String,
    /// Capacity of the memory backend (0 = unbounded)
    pub max_entries: usize,
    /// HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_BACKEND` - file, memory, sqlite or memcached (default: file)
    /// - `CACHE_DIR` - File backend directory (default: ./cache)
    /// - `CACHE_SQLITE_PATH` - SQLite database (default: :memory:)
    /// - `CACHE_MEMCACHED_ADDR` - Memcached server (default: 127.0.0.1:11211)
    /// - `CACHE_KEY_PREFIX` - Memcached key namespace (default: empty)
    /// - `CACHE_MAX_ENTRIES` - Memory backend capacity (default: 0, unbounded)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    ///
    /// An unknown backend name is an error; unparsable numbers fall back to
    /// their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let backend = match lookup("CACHE_BACKEND") {
            Some(name) => Backend::from_str(&name)?,
            None => defaults.backend,
        };

        Ok(Self {
            backend,
            cache_dir: lookup("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            sqlite_path: lookup("CACHE_SQLITE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sqlite_path),
            memcached_addr: lookup("CACHE_MEMCACHED_ADDR").unwrap_or(defaults.memcached_addr),
            key_prefix: lookup("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_entries: lookup("CACHE_MAX_ENTRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_entries),
            server_port: lookup("SERVER_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.server_port),
        })
    }

    /// Opens the configured backend.
    ///
    /// Fails when the file backend directory cannot be created or written,
    /// or when the SQLite database cannot be opened. The memcached backend
    /// connects lazily and never fails here.
    pub fn open_storage(&self) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match self.backend {
            Backend::File => Arc::new(FileStorage::new(&self.cache_dir)?),
            Backend::Memory => Arc::new(MemoryStorage::with_capacity(self.max_entries)),
            Backend::Sqlite => Arc::new(SqliteStorage::open(&self.sqlite_path)?),
            Backend::Memcached => {
                if self.memcached_addr.is_empty() {
                    return Err(CacheError::Config(
                        "memcached address must not be empty".to_string(),
                    ));
                }
                Arc::new(MemcachedStorage::connect(
                    self.memcached_addr.clone(),
                    self.key_prefix.clone(),
                ))
            }
        };

        info!("Opened {} storage backend", self.backend.as_str());
        Ok(storage)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::File,
            cache_dir: PathBuf::from("./cache"),
            sqlite_path: PathBuf::from(sqlite::IN_MEMORY),
            memcached_addr: "127.0.0.1:11211".to_string(),
            key_prefix: String::new(),
            max_entries: 0,
            server_port: 3000,
        }
    }
}
