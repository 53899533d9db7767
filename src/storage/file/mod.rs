//! File Storage
//!
//! One record file per key under a base directory. Writers hold an
//! exclusive OS lock on the record, readers a shared one, so the store is
//! safe to share between processes pointed at the same directory.

mod lock;
mod path;
mod record;


use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::storage::{expiry, CacheValue, Storage};

pub use lock::{acquire_exclusive, acquire_shared, is_same_file, LockedFile};
use lock::LockTable;
pub use path::{PathResolver, PrefixPattern, KEY_SEPARATOR};
pub use record::{RecordMeta, HEADER_LEN, MAX_HEADER_LEN, RECORD_VERSION};

// == File Storage ==
/// Cache storage backed by one locked file per key.
#[derive(Debug)]
pub struct FileStorage {
    /// Key to path mapping
    resolver: PathResolver,
    /// Exclusive locks pending a write or remove
    locks: LockTable,
}

impl FileStorage {
    // == Constructor ==
    /// Opens a store rooted at `dir`, creating the directory if needed.
    ///
    /// Fails if the directory cannot be created or is not writable.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let dir_error = |source: io::Error| CacheError::Directory {
            path: dir.clone(),
            source,
        };

        fs::create_dir_all(&dir).map_err(dir_error)?;
        let metadata = fs::metadata(&dir).map_err(dir_error)?;
        if !metadata.is_dir() || metadata.permissions().readonly() {
            return Err(dir_error(io::Error::from(io::ErrorKind::PermissionDenied)));
        }

        info!("File storage opened at {}", dir.display());
        Ok(Self {
            resolver: PathResolver::new(dir),
            locks: LockTable::new(),
        })
    }

    /// Base directory of the store.
    pub fn dir(&self) -> &Path {
        self.resolver.base()
    }

    /// Number of keys locked by `lock` and not yet written or removed.
    pub fn pending_locks(&self) -> usize {
        self.locks.len()
    }

    /// Resolved record path for `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        self.resolver.resolve(key)
    }

    // == Read ==
    fn try_read(&self, key: &str) -> Result<Option<CacheValue>> {
        let path = self.resolver.resolve(key)?;

        // This thread already holds the exclusive lock for this key: read
        // through a clone of that handle, a shared lock would wait on
        // ourselves.
        if let Some(file) = self.locks.owned_file(key) {
            let mut file = file?;
            let (meta, data) = match read_record(&mut file) {
                Ok(record) => record,
                Err(CacheError::MalformedRecord(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            if !expiry::is_valid(meta.expires, expiry::now_secs()) {
                // The lock stays pending, the following write recreates
                // the file.
                if is_same_file(&path, &file) {
                    debug!("Key '{}' expired under lock, removing record", key);
                    delete_record(&path, None);
                }
                return Ok(None);
            }
            return Ok(Some(CacheValue {
                data,
                serialized: meta.serialized,
            }));
        }

        let Some(mut locked) = acquire_shared(&path)? else {
            return Ok(None);
        };

        let (meta, data) = match read_record(locked.file()) {
            Ok(record) => record,
            Err(CacheError::MalformedRecord(reason)) => {
                debug!("Unreadable record for key '{}': {}", key, reason);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !expiry::is_valid(meta.expires, expiry::now_secs()) {
            debug!("Key '{}' expired, removing record", key);
            delete_expired(&path, locked);
            return Ok(None);
        }

        Ok(Some(CacheValue {
            data,
            serialized: meta.serialized,
        }))
    }

    // == Lock ==
    fn try_lock(&self, key: &str) -> Result<()> {
        let path = self.resolver.resolve(key)?;
        self.locks.acquire(key, || acquire_exclusive(&path))?;
        Ok(())
    }

    // == Write ==
    fn try_write(&self, key: &str, value: &CacheValue, ttl_secs: u64) -> Result<()> {
        let path = self.resolver.resolve(key)?;
        let meta = RecordMeta::new(
            expiry::expires_at(ttl_secs, expiry::now_secs()),
            value.serialized,
        );

        self.locks.consume(key, |held| {
            let mut locked = match held.filter(LockedFile::is_linked) {
                Some(locked) => locked,
                None => acquire_exclusive(&path)?,
            };

            if let Err(e) = write_record(&mut locked, &meta, &value.data) {
                delete_record(&path, Some(locked));
                return Err(e);
            }
            Ok(())
        })
    }

    // == Clean ==
    fn try_clean(&self, prefix: &str) -> Result<()> {
        let pattern = if prefix.is_empty() {
            PrefixPattern {
                dir: self.dir().to_path_buf(),
                stem: String::new(),
            }
        } else {
            self.resolver.resolve_prefix(prefix)?
        };

        let entries = match fs::read_dir(&pattern.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0usize;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_str().is_some_and(|name| pattern.matches(name)) {
                continue;
            }

            let path = entry.path();
            if entry.file_type()?.is_dir() {
                removed += remove_tree(&path)?;
            } else {
                delete_record(&path, None);
                removed += 1;
            }
        }

        debug!("Clean '{}' removed {} records", prefix, removed);
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Option<CacheValue> {
        self.try_read(key).unwrap_or_else(|e| {
            warn!("Cache read of '{}' failed: {}", key, e);
            None
        })
    }

    fn lock(&self, key: &str) {
        if let Err(e) = self.try_lock(key) {
            warn!("Cache lock of '{}' failed: {}", key, e);
        }
    }

    fn write(&self, key: &str, value: CacheValue, ttl_secs: u64) {
        if let Err(e) = self.try_write(key, &value, ttl_secs) {
            warn!("Cache write of '{}' failed: {}", key, e);
        }
    }

    fn remove(&self, key: &str) {
        match self.resolver.resolve(key) {
            Ok(path) => self.locks.consume(key, |held| delete_record(&path, held)),
            Err(e) => warn!("Cache remove of '{}' failed: {}", key, e),
        }
    }

    fn clean(&self, prefix: &str) {
        if let Err(e) = self.try_clean(prefix) {
            warn!("Cache clean of '{}' failed: {}", prefix, e);
        }
    }
}

// == Record I/O ==
/// Reads a whole record from the start of `file`.
fn read_record(file: &mut fs::File) -> Result<(RecordMeta, Vec<u8>)> {
    file.seek(SeekFrom::Start(0))?;
    let meta = record::read_meta(file)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok((meta, data))
}

/// Replaces the contents of a locked record file.
fn write_record(locked: &mut LockedFile, meta: &RecordMeta, payload: &[u8]) -> Result<()> {
    let bytes = record::encode(meta, payload)?;
    let file = locked.file();
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Unlinks a record file, then releases `handle`.
///
/// Where the platform refuses to unlink an open file, the handle is closed
/// first and the unlink retried.
fn delete_record(path: &Path, handle: Option<LockedFile>) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            debug!("Retrying delete of {} after close: {}", path.display(), e);
            drop(handle);
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// Unlinks an expired record read under `locked`, unless the path was
/// unlinked or replaced by a newer record after the read.
fn delete_expired(path: &Path, locked: LockedFile) {
    if is_same_file(path, locked.as_file()) {
        delete_record(path, Some(locked));
    } else {
        debug!("Record {} replaced since read, keeping it", path.display());
    }
}

/// Removes every record under `dir`, then the emptied directories.
///
/// Returns the number of records removed. Directories that gained new
/// records concurrently are left in place.
fn remove_tree(dir: &Path) -> Result<usize> {
    let mut removed = 0usize;
    for entry in WalkDir::new(dir).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(io::Error::from(e).into()),
        };

        if entry.file_type().is_dir() {
            if let Err(e) = fs::remove_dir(entry.path()) {
                debug!("Keeping directory {}: {}", entry.path().display(), e);
            }
        } else {
            delete_record(entry.path(), None);
            removed += 1;
        }
    }
    Ok(removed)
}
