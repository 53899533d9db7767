//! Storage Module
//!
//! The storage contract shared by every backend, plus the backends
//! themselves: a file-locked on-disk store, an in-process map, an SQLite
//! table and a memcached client.

use std::collections::BTreeMap;

pub mod expiry;
pub mod file;
pub mod memcached;
pub mod memory;
pub mod sqlite;

pub use file::FileStorage;
pub use memcached::{MemcachedClient, MemcachedStorage, RemoteClient};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

// == Cache Value ==
/// A stored value: opaque bytes plus a flag telling whether the bytes were
/// produced by a value codec and need decoding on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheValue {
    /// Payload bytes
    pub data: Vec<u8>,
    /// True when `data` was produced by a value codec
    pub serialized: bool,
}

impl CacheValue {
    /// Wraps raw bytes that need no decoding.
    pub fn raw(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            serialized: false,
        }
    }

    /// Wraps codec output.
    pub fn serialized(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            serialized: true,
        }
    }
}

/// Result of a bulk read: every requested key maps to a value or a miss.
pub type BulkResult = BTreeMap<String, Option<CacheValue>>;

// == Storage Trait ==
/// Uniform contract implemented by every backend.
///
/// None of the per-key operations fail: storage faults are logged and
/// degrade to a miss (reads) or a no-op (writes). Only construction of a
/// backend can return an error.
pub trait Storage: Send + Sync {
    /// Reads a value. Missing, expired and unreadable entries are a miss.
    fn read(&self, key: &str) -> Option<CacheValue>;

    /// Reads several keys independently. Every input key is present in the
    /// result, misses included.
    fn bulk_read(&self, keys: &[String]) -> BulkResult {
        keys.iter()
            .map(|key| (key.clone(), self.read(key)))
            .collect()
    }

    /// Takes an exclusive lock on `key` that is held until the next `write`
    /// or `remove` of the same key. Best effort; backends without locking
    /// treat it as a no-op.
    fn lock(&self, key: &str);

    /// Stores `value` under `key`, replacing any previous value.
    /// `ttl_secs == 0` means the entry never expires.
    fn write(&self, key: &str, value: CacheValue, ttl_secs: u64);

    /// Removes `key`. Removing a missing key is fine.
    fn remove(&self, key: &str);

    /// Removes every entry whose key starts with `prefix`; an empty prefix
    /// removes everything.
    fn clean(&self, prefix: &str);
}

// == Backend ==
/// Backend variants selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    File,
    Memory,
    Sqlite,
    Memcached,
}

impl Backend {
    /// Name used in configuration and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::File => "file",
            Backend::Memory => "memory",
            Backend::Sqlite => "sqlite",
            Backend::Memcached => "memcached",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = crate::error::CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "fs" => Ok(Backend::File),
            "memory" | "mem" => Ok(Backend::Memory),
            "sqlite" | "sql" => Ok(Backend::Sqlite),
            "memcached" | "memcache" => Ok(Backend::Memcached),
            other => Err(crate::error::CacheError::Config(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str() {
        assert_eq!("file".parse::<Backend>().unwrap(), Backend::File);
        assert_eq!("Memory".parse::<Backend>().unwrap(), Backend::Memory);
        assert_eq!(" sqlite ".parse::<Backend>().unwrap(), Backend::Sqlite);
        assert_eq!("memcached".parse::<Backend>().unwrap(), Backend::Memcached);
        assert!("redis".parse::<Backend>().is_err());
    }

    #[test]
    fn test_cache_value_constructors() {
        assert!(!CacheValue::raw("x").serialized);
        assert!(CacheValue::serialized("1").serialized);
        assert_eq!(CacheValue::raw(vec![1u8, 2]).data, vec![1, 2]);
    }
}
