//! Lock Manager
//!
//! OS-level advisory locks (via `fs2`) on record files, plus the per-store
//! table of exclusive locks taken by a standalone `lock` call and waiting
//! for the `write` or `remove` that consumes them.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};

// == Locked File ==
/// An open record file holding a shared or exclusive lock.
///
/// The lock is released when the guard is dropped, on every exit path.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn as_file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns false once the record file has been unlinked while this
    /// handle was open (or was waiting for its lock).
    pub fn is_linked(&self) -> bool {
        is_linked(&self.file)
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// == Acquire Exclusive ==
/// Opens (creating if needed) the record file at `path` and blocks until an
/// exclusive lock is granted. Missing parent directories are created.
pub fn acquire_exclusive(path: &Path) -> io::Result<LockedFile> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    loop {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;

        // A reader may have deleted the record while we waited; a lock on
        // the orphaned inode protects nothing.
        if is_linked(&file) {
            return Ok(LockedFile {
                file,
                path: path.to_path_buf(),
            });
        }
        let _ = FileExt::unlock(&file);
    }
}

#[cfg(unix)]
fn is_linked(file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;
    file.metadata().map(|m| m.nlink() > 0).unwrap_or(true)
}

#[cfg(not(unix))]
fn is_linked(_file: &File) -> bool {
    true
}

/// Returns true if `path` still names the file open as `file`.
///
/// False once the path was unlinked or replaced by a newer record.
#[cfg(unix)]
pub fn is_same_file(path: &Path, file: &File) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(path), file.metadata()) {
        (Ok(on_disk), Ok(open)) => on_disk.dev() == open.dev() && on_disk.ino() == open.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
pub fn is_same_file(path: &Path, _file: &File) -> bool {
    path.exists()
}

// == Acquire Shared ==
/// Opens the record file at `path` for reading and blocks until a shared
/// lock is granted. Returns `Ok(None)` without locking if the file does not
/// exist.
pub fn acquire_shared(path: &Path) -> io::Result<Option<LockedFile>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    file.lock_shared()?;

    Ok(Some(LockedFile {
        file,
        path: path.to_path_buf(),
    }))
}

// == Lock Table ==
/// A lock-table slot. `locked` is `None` while the owner is still waiting
/// for the OS lock, or while the owner is consuming the lock.
#[derive(Debug)]
struct Slot {
    owner: ThreadId,
    locked: Option<LockedFile>,
}

/// Exclusive locks held on behalf of callers between `lock` and the
/// following `write`/`remove`, keyed by cache key.
///
/// Each slot belongs to the thread that created it. Other threads of the
/// same store wait on the condition variable until the slot is released.
/// The mutex is never held while waiting for an OS lock.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    slots: Mutex<HashMap<String, Slot>>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `key` for the calling thread, waiting while another thread
    /// owns it. Returns false if the calling thread already owns it.
    fn reserve(&self, key: &str) -> bool {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        loop {
            match slots.get(key).map(|slot| slot.owner) {
                None => break,
                Some(owner) if owner == me => return false,
                Some(_) => self.released.wait(&mut slots),
            }
        }
        slots.insert(
            key.to_string(),
            Slot {
                owner: me,
                locked: None,
            },
        );
        true
    }

    fn release(&self, key: &str) {
        self.slots.lock().remove(key);
        self.released.notify_all();
    }

    /// Takes an exclusive lock on `key` for the calling thread and keeps it
    /// until the same thread consumes it. A no-op if the thread already
    /// holds it.
    pub fn acquire(
        &self,
        key: &str,
        open: impl FnOnce() -> io::Result<LockedFile>,
    ) -> io::Result<()> {
        if !self.reserve(key) {
            return Ok(());
        }
        match open() {
            Ok(locked) => {
                if let Some(slot) = self.slots.lock().get_mut(key) {
                    slot.locked = Some(locked);
                }
                Ok(())
            }
            Err(e) => {
                self.release(key);
                Err(e)
            }
        }
    }

    /// Runs `f` with the caller's pending lock on `key`, if any, then
    /// releases the slot.
    ///
    /// While another thread owns `key` this waits for it to be released.
    /// The slot stays reserved while `f` runs, so other threads of this
    /// store cannot interleave with it.
    pub fn consume<R>(&self, key: &str, f: impl FnOnce(Option<LockedFile>) -> R) -> R {
        let me = thread::current().id();
        let held = {
            let mut slots = self.slots.lock();
            loop {
                match slots.get(key).map(|slot| slot.owner) {
                    Some(owner) if owner != me => self.released.wait(&mut slots),
                    _ => break,
                }
            }
            let slot = slots.entry(key.to_string()).or_insert(Slot {
                owner: me,
                locked: None,
            });
            slot.locked.take()
        };

        let _release = Release { table: self, key };
        f(held)
    }

    /// A second handle on the calling thread's pending lock for `key`.
    ///
    /// The clone shares the locked open file, so reading through it needs
    /// no further locking and does not keep the table busy.
    pub fn owned_file(&self, key: &str) -> Option<io::Result<File>> {
        let me = thread::current().id();
        let slots = self.slots.lock();
        slots
            .get(key)
            .filter(|slot| slot.owner == me)
            .and_then(|slot| slot.locked.as_ref())
            .map(|locked| locked.as_file().try_clone())
    }

    /// Number of keys reserved or locked.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Releases a slot on every exit path of [`LockTable::consume`].
struct Release<'a> {
    table: &'a LockTable,
    key: &'a str,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.table.release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_shared_on_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let result = acquire_shared(&dir.path().join("missing")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_exclusive_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join("c");

        let locked = acquire_exclusive(&path).unwrap();
        assert_eq!(locked.path(), path.as_path());
        assert!(path.exists());
    }

    #[test]
    fn test_exclusive_blocks_other_handles_until_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");

        let locked = acquire_exclusive(&path).unwrap();

        let other = File::open(&path).unwrap();
        assert!(other.try_lock_shared().is_err());

        drop(locked);
        assert!(other.try_lock_shared().is_ok());
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");
        drop(acquire_exclusive(&path).unwrap());

        let first = acquire_shared(&path).unwrap().unwrap();
        let second = acquire_shared(&path).unwrap().unwrap();

        let writer = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(writer.try_lock_exclusive().is_err());

        drop(first);
        drop(second);
        assert!(writer.try_lock_exclusive().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_unlinked_handle_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");

        let locked = acquire_exclusive(&path).unwrap();
        assert!(locked.is_linked());

        fs::remove_file(&path).unwrap();
        assert!(!locked.is_linked());
    }

    #[cfg(unix)]
    #[test]
    fn test_same_file_detects_replacement() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key");

        let old = acquire_exclusive(&path).unwrap();
        assert!(is_same_file(&path, old.as_file()));

        fs::remove_file(&path).unwrap();
        assert!(!is_same_file(&path, old.as_file()));

        let _new = acquire_exclusive(&path).unwrap();
        assert!(!is_same_file(&path, old.as_file()));
    }

    #[test]
    fn test_lock_table_consume_hands_over_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k");
        let table = LockTable::new();

        table.acquire("k", || acquire_exclusive(&path)).unwrap();
        assert_eq!(table.len(), 1);

        let handed = table.consume("k", |held| held.map(|locked| locked.path().to_path_buf()));
        assert_eq!(handed, Some(path));
        assert_eq!(table.len(), 0);

        assert!(table.consume("k", |held| held.is_none()));
    }

    #[test]
    fn test_lock_table_is_reentrant_for_owner() {
        let dir = TempDir::new().unwrap();
        let table = LockTable::new();
        let path = dir.path().join("k");

        table.acquire("k", || acquire_exclusive(&path)).unwrap();
        // A second acquire by the owner must not try to lock again.
        table
            .acquire("k", || Err(io::Error::from(io::ErrorKind::Other)))
            .unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lock_table_failed_acquire_frees_slot() {
        let table = LockTable::new();
        let result = table.acquire("k", || Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(result.is_err());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_owned_file_only_for_owner() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(LockTable::new());
        table
            .acquire("k", || acquire_exclusive(&dir.path().join("k")))
            .unwrap();

        assert!(table.owned_file("k").unwrap().is_ok());
        assert!(table.owned_file("other").is_none());

        let shared = table.clone();
        let from_other_thread = thread::spawn(move || shared.owned_file("k").is_none())
            .join()
            .unwrap();
        assert!(from_other_thread);
    }

    #[test]
    fn test_other_thread_waits_for_owner() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k");
        let table = Arc::new(LockTable::new());
        table.acquire("k", || acquire_exclusive(&path)).unwrap();

        let shared = table.clone();
        let waiter = thread::spawn(move || shared.consume("k", |held| held.is_some()));

        thread::sleep(Duration::from_millis(200));
        assert!(!waiter.is_finished(), "non-owner must wait for the slot");

        table.consume("k", drop);
        // The owner's lock was consumed; the waiter gets an empty slot.
        assert!(!waiter.join().unwrap());
        assert_eq!(table.len(), 0);
    }
}
