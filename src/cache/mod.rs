//! Cache Module
//!
//! Typed front door over any [`Storage`] backend. Raw bytes go straight to
//! the backend; everything else passes through a [`ValueCodec`] and is
//! flagged as serialized so it can be decoded on the way out.

mod codec;
mod stats;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::storage::{BulkResult, CacheValue, Storage};

pub use codec::{JsonCodec, ValueCodec};
pub use stats::CacheStats;

// == Cache ==
/// A storage backend plus a value codec and usage counters.
pub struct Cache<C: ValueCodec = JsonCodec> {
    storage: Arc<dyn Storage>,
    codec: C,
    stats: Mutex<CacheStats>,
}

impl Cache<JsonCodec> {
    /// Wraps `storage` with the JSON codec.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_codec(storage, JsonCodec)
    }
}

impl<C: ValueCodec> Cache<C> {
    pub fn with_codec(storage: Arc<dyn Storage>, codec: C) -> Self {
        Self {
            storage,
            codec,
            stats: Mutex::new(CacheStats::new()),
        }
    }

    /// The underlying backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Snapshot of the usage counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    // == Reads ==
    /// Reads the stored value as-is.
    pub fn get_raw(&self, key: &str) -> Option<CacheValue> {
        let value = self.storage.read(key);
        self.stats.lock().record_read(value.is_some());
        value
    }

    /// Reads and decodes a value.
    ///
    /// Serialized values go through the codec; raw values must be UTF-8 and
    /// are handed to `T` as a string.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_raw(key)
            .map(|value| self.decode(value))
            .transpose()
    }

    /// Reads several keys; every key is present in the result.
    pub fn get_many(&self, keys: &[String]) -> BulkResult {
        let result = self.storage.bulk_read(keys);
        let mut stats = self.stats.lock();
        for value in result.values() {
            stats.record_read(value.is_some());
        }
        result
    }

    /// Decodes a value read through [`get_raw`](Self::get_raw) or
    /// [`get_many`](Self::get_many).
    pub fn decode<T: DeserializeOwned>(&self, value: CacheValue) -> Result<T> {
        if value.serialized {
            return self.codec.decode(&value.data);
        }
        let text = String::from_utf8(value.data).map_err(|_| {
            <serde_json::Error as serde::de::Error>::custom("raw value is not valid UTF-8")
        })?;
        Ok(serde_json::from_value(serde_json::Value::String(text))?)
    }

    // == Writes ==
    /// Stores raw bytes. `ttl_secs == 0` never expires.
    pub fn set_raw(&self, key: &str, data: impl Into<Vec<u8>>, ttl_secs: u64) {
        self.storage.write(key, CacheValue::raw(data), ttl_secs);
        self.stats.lock().record_write();
    }

    /// Encodes and stores a value. `ttl_secs == 0` never expires.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()> {
        let data = self.codec.encode(value)?;
        self.storage
            .write(key, CacheValue::serialized(data), ttl_secs);
        self.stats.lock().record_write();
        Ok(())
    }

    /// Read-modify-write under the backend's exclusive lock.
    ///
    /// The key stays locked from the read until the new value is written, so
    /// concurrent `update` calls on a locking backend never lose an update,
    /// whether the threads share one store or each open their own.
    /// A current value that fails to decode is passed to `f` as `None`.
    pub fn update<T, F>(&self, key: &str, ttl_secs: u64, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        self.storage.lock(key);

        let current = match self.get::<T>(key) {
            Ok(current) => current,
            Err(e) => {
                warn!("Discarding undecodable value of '{}': {}", key, e);
                None
            }
        };
        let next = f(current);

        match self.codec.encode(&next) {
            Ok(data) => {
                self.storage
                    .write(key, CacheValue::serialized(data), ttl_secs);
                self.stats.lock().record_write();
                Ok(next)
            }
            Err(e) => {
                // Releases the lock taken above.
                self.remove(key);
                Err(e)
            }
        }
    }

    // == Locking and removal ==
    /// Locks `key` until the next write or remove of it by the calling
    /// thread.
    pub fn lock(&self, key: &str) {
        self.storage.lock(key);
    }

    pub fn remove(&self, key: &str) {
        self.storage.remove(key);
        self.stats.lock().record_removal();
    }

    /// Removes every key starting with `prefix` (everything if empty).
    pub fn clean(&self, prefix: &str) {
        self.storage.clean(prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use crate::storage::{FileStorage, MemoryStorage};
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Session {
        user: String,
        roles: Vec<String>,
    }

    fn memory_cache() -> Cache {
        Cache::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_typed_roundtrip_sets_serialized_flag() {
        let cache = memory_cache();
        let session = Session {
            user: "ada".to_string(),
            roles: vec!["admin".to_string()],
        };

        cache.set("session-1", &session, 0).unwrap();

        assert!(cache.get_raw("session-1").unwrap().serialized);
        assert_eq!(cache.get::<Session>("session-1").unwrap(), Some(session));
    }

    #[test]
    fn test_raw_string_bypasses_codec() {
        let cache = memory_cache();
        cache.set_raw("greeting", "hello", 0);

        let raw = cache.get_raw("greeting").unwrap();
        assert!(!raw.serialized);
        assert_eq!(raw.data, b"hello");
        assert_eq!(cache.get::<String>("greeting").unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn test_raw_binary_cannot_be_typed() {
        let cache = memory_cache();
        cache.set_raw("blob", vec![0xffu8, 0xfe], 0);
        assert!(matches!(cache.get::<String>("blob"), Err(CacheError::Codec(_))));
    }

    #[test]
    fn test_get_missing_is_none() {
        let cache = memory_cache();
        assert_eq!(cache.get::<Session>("nope").unwrap(), None);
    }

    #[test]
    fn test_stats_track_operations() {
        let cache = memory_cache();
        cache.set_raw("a", "1", 0);
        cache.get_raw("a");
        cache.get_raw("b");
        cache.get_many(&["a".to_string(), "c".to_string()]);
        cache.remove("a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.removals, 1);
    }

    #[test]
    fn test_update_on_file_storage() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(Arc::new(FileStorage::new(dir.path()).unwrap()));

        assert_eq!(cache.update("counter", 0, |n: Option<u64>| n.unwrap_or(0) + 1).unwrap(), 1);
        assert_eq!(cache.update("counter", 0, |n: Option<u64>| n.unwrap_or(0) + 1).unwrap(), 2);
        assert_eq!(cache.get::<u64>("counter").unwrap(), Some(2));
    }

    #[test]
    fn test_update_replaces_undecodable_value() {
        let cache = memory_cache();
        cache.set_raw("counter", "not a number", 0);

        let value = cache.update("counter", 0, |n: Option<u64>| n.unwrap_or(10)).unwrap();
        assert_eq!(value, 10);
        assert_eq!(cache.get::<u64>("counter").unwrap(), Some(10));
    }
}
