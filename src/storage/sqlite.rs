//! SQLite Storage
//!
//! Table-backed backend: one row per key with the payload, the codec flag
//! and an optional absolute expiry. Expired rows are filtered out by every
//! read query.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::{expiry, BulkResult, CacheValue, Storage};

/// Path that opens a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache (
        key TEXT NOT NULL PRIMARY KEY,
        data BLOB NOT NULL,
        serialized INTEGER NOT NULL DEFAULT 0,
        expires INTEGER
    );
    CREATE INDEX IF NOT EXISTS cache_expires ON cache(expires);
";

// == SQLite Storage ==
/// Cache storage kept in an SQLite table.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    // == Constructor ==
    /// Opens (or creates) the database at `path` and ensures the schema.
    /// Pass [`IN_MEMORY`] for a throwaway database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == IN_MEMORY {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };

        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "synchronous", "OFF")?;

        info!("SQLite storage opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn try_read(&self, key: &str) -> Result<Option<CacheValue>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT data, serialized FROM cache
                 WHERE key = ?1 AND (expires IS NULL OR expires > ?2)",
                params![key, expiry::now_secs()],
                |row| {
                    Ok(CacheValue {
                        data: row.get(0)?,
                        serialized: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn try_bulk_read(&self, keys: &[String]) -> Result<BulkResult> {
        let mut result: BulkResult = keys.iter().map(|key| (key.clone(), None)).collect();
        if keys.is_empty() {
            return Ok(result);
        }

        let placeholders = vec!["?"; keys.len()].join(",");
        let sql = format!(
            "SELECT key, data, serialized FROM cache
             WHERE key IN ({}) AND (expires IS NULL OR expires > ?)",
            placeholders
        );

        let now = expiry::now_secs();
        let mut args: Vec<&dyn rusqlite::ToSql> =
            keys.iter().map(|key| key as &dyn rusqlite::ToSql).collect();
        args.push(&now);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, String>(0)?,
                CacheValue {
                    data: row.get(1)?,
                    serialized: row.get(2)?,
                },
            ))
        })?;

        for row in rows {
            let (key, value) = row?;
            result.insert(key, Some(value));
        }
        Ok(result)
    }

    fn try_write(&self, key: &str, value: &CacheValue, ttl_secs: u64) -> Result<()> {
        let expires = expiry::expires_at(ttl_secs, expiry::now_secs());
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "REPLACE INTO cache (key, data, serialized, expires) VALUES (?1, ?2, ?3, ?4)",
            params![key, value.data, value.serialized, expires],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn try_remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn try_clean(&self, prefix: &str) -> Result<()> {
        let conn = self.conn.lock();
        if prefix.is_empty() {
            conn.execute("DELETE FROM cache", [])?;
        } else {
            // Case-sensitive prefix match, LIKE would fold ASCII case.
            conn.execute(
                "DELETE FROM cache WHERE expires <= ?1 OR substr(key, 1, length(?2)) = ?2",
                params![expiry::now_secs(), prefix],
            )?;
        }
        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn read(&self, key: &str) -> Option<CacheValue> {
        self.try_read(key).unwrap_or_else(|e| {
            warn!("Cache read of '{}' failed: {}", key, e);
            None
        })
    }

    fn bulk_read(&self, keys: &[String]) -> BulkResult {
        self.try_bulk_read(keys).unwrap_or_else(|e| {
            warn!("Cache bulk read of {} keys failed: {}", keys.len(), e);
            keys.iter().map(|key| (key.clone(), None)).collect()
        })
    }

    fn lock(&self, _key: &str) {}

    fn write(&self, key: &str, value: CacheValue, ttl_secs: u64) {
        if let Err(e) = self.try_write(key, &value, ttl_secs) {
            warn!("Cache write of '{}' failed: {}", key, e);
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.try_remove(key) {
            warn!("Cache remove of '{}' failed: {}", key, e);
        }
    }

    fn clean(&self, prefix: &str) {
        if let Err(e) = self.try_clean(prefix) {
            warn!("Cache clean of '{}' failed: {}", prefix, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn store() -> SqliteStorage {
        SqliteStorage::open(IN_MEMORY).unwrap()
    }

    #[test]
    fn test_write_and_read() {
        let store = store();
        store.write("k", CacheValue::raw(vec![0u8, 255, 7]), 0);
        assert_eq!(store.read("k"), Some(CacheValue::raw(vec![0u8, 255, 7])));
    }

    #[test]
    fn test_serialized_flag_survives() {
        let store = store();
        store.write("k", CacheValue::serialized("{}"), 0);
        assert!(store.read("k").unwrap().serialized);
    }

    #[test]
    fn test_overwrite() {
        let store = store();
        store.write("k", CacheValue::raw("1"), 0);
        store.write("k", CacheValue::raw("2"), 0);
        assert_eq!(store.read("k"), Some(CacheValue::raw("2")));
    }

    #[test]
    fn test_ttl_expiration() {
        let store = store();
        store.write("k", CacheValue::raw("v"), 2);
        assert!(store.read("k").is_some());

        sleep(Duration::from_millis(2100));
        assert_eq!(store.read("k"), None);
    }

    #[test]
    fn test_bulk_read_keeps_misses() {
        let store = store();
        store.write("k1", CacheValue::raw("v1"), 0);
        store.write("k3", CacheValue::raw("v3"), 0);

        let keys = vec!["k1".to_string(), "k2".to_string(), "k3".to_string()];
        let result = store.bulk_read(&keys);
        assert_eq!(result.len(), 3);
        assert_eq!(result["k1"], Some(CacheValue::raw("v1")));
        assert_eq!(result["k2"], None);
        assert_eq!(result["k3"], Some(CacheValue::raw("v3")));

        assert!(store.bulk_read(&[]).is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = store();
        store.remove("missing");
        store.write("k", CacheValue::raw("v"), 0);
        store.remove("k");
        store.remove("k");
        assert_eq!(store.read("k"), None);
    }

    #[test]
    fn test_clean_prefix_escapes_wildcards() {
        let store = store();
        store.write("a_1", CacheValue::raw("1"), 0);
        store.write("ab1", CacheValue::raw("2"), 0);
        store.write("x", CacheValue::raw("3"), 0);

        store.clean("a_");
        assert_eq!(store.read("a_1"), None);
        assert!(store.read("ab1").is_some(), "'_' must not act as a wildcard");
        assert!(store.read("x").is_some());

        store.clean("");
        assert_eq!(store.read("x"), None);
    }

    #[test]
    fn test_clean_prefix_is_case_sensitive() {
        let store = store();
        store.write("user-1", CacheValue::raw("1"), 0);
        store.write("User-1", CacheValue::raw("2"), 0);
        store.write("USER-2", CacheValue::raw("3"), 0);

        store.clean("user");
        assert_eq!(store.read("user-1"), None);
        assert_eq!(store.read("User-1"), Some(CacheValue::raw("2")));
        assert_eq!(store.read("USER-2"), Some(CacheValue::raw("3")));
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.db");

        SqliteStorage::open(&path)
            .unwrap()
            .write("k", CacheValue::raw("v"), 0);

        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(reopened.read("k"), Some(CacheValue::raw("v")));
    }
}
