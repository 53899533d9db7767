//! Memory Storage
//!
//! In-process map backend. Entries carry an absolute expiry and are dropped
//! lazily when read after it. Locking is a no-op: the map is already
//! serialized by its own `RwLock` and is invisible to other processes.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::storage::{expiry, CacheValue, Storage};

// == Memory Entry ==
/// A stored value plus its absolute expiry.
#[derive(Debug, Clone)]
struct MemoryEntry {
    value: CacheValue,
    /// Expiration timestamp (Unix seconds), None = no expiration
    expires: Option<i64>,
}

impl MemoryEntry {
    fn is_valid(&self, now: i64) -> bool {
        expiry::is_valid(self.expires, now)
    }
}

// == Memory Storage ==
/// Cache storage kept in a process-local map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, MemoryEntry>>,
    /// Maximum number of entries; 0 = unbounded
    max_entries: usize,
}

impl MemoryStorage {
    /// Creates an unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding at most `max_entries` entries (0 = unbounded).
    ///
    /// When full, expired entries are purged first; if that frees nothing,
    /// the new write is dropped.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = expiry::now_secs();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(now));
        before - entries.len()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Option<CacheValue> {
        let now = expiry::now_secs();
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_valid(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        debug!("Key '{}' expired, removing entry", key);
        let mut entries = self.entries.write();
        // Re-check: a writer may have replaced the entry in between.
        if entries.get(key).is_some_and(|entry| !entry.is_valid(now)) {
            entries.remove(key);
        }
        None
    }

    fn lock(&self, _key: &str) {}

    fn write(&self, key: &str, value: CacheValue, ttl_secs: u64) {
        let now = expiry::now_secs();
        let entry = MemoryEntry {
            value,
            expires: expiry::expires_at(ttl_secs, now),
        };

        let mut entries = self.entries.write();
        let is_overwrite = entries.contains_key(key);

        if !is_overwrite && self.max_entries > 0 && entries.len() >= self.max_entries {
            entries.retain(|_, entry| entry.is_valid(now));
            if entries.len() >= self.max_entries {
                warn!(
                    "Memory storage full ({} entries), dropping write of '{}'",
                    self.max_entries, key
                );
                return;
            }
        }

        entries.insert(key.to_string(), entry);
    }

    fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    fn clean(&self, prefix: &str) {
        let mut entries = self.entries.write();
        if prefix.is_empty() {
            entries.clear();
        } else {
            entries.retain(|key, _| !key.starts_with(prefix));
        }
    }
}
