//! Memcached Storage
//!
//! Distributed backend delegating to a memcached server. Keys are
//! namespaced with a store prefix and percent-encoded so any cache key is a
//! legal memcached key. The codec flag travels in the item flags.
//!
//! The backend talks to the server through the [`RemoteClient`] trait;
//! [`MemcachedClient`] implements it over the `memcache` crate.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use memcache::{Client, MemcacheError, ToMemcacheValue};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::storage::{expiry, BulkResult, CacheValue, Storage};

/// Item flag bit marking codec output.
pub const FLAG_SERIALIZED: u32 = 1;

/// Relative expirations above this are read by memcached as Unix timestamps.
const MAX_RELATIVE_EXPTIME: u64 = 60 * 60 * 24 * 30;

/// Default connect and I/O timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

// == Remote Item ==
/// A value as stored on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub data: Vec<u8>,
    pub flags: u32,
}

// == Remote Client ==
/// Operations the memcached backend needs from a client. Keys passed here
/// are already encoded.
pub trait RemoteClient: Send + Sync {
    /// Fetches every present key; absent keys are simply missing from the map.
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, RemoteItem>>;

    /// Stores an item; `exptime` follows memcached rules (0 = never).
    fn set(&self, key: &str, item: &RemoteItem, exptime: u64) -> Result<()>;

    /// Deletes a key. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Invalidates every item on the server.
    fn flush(&self) -> Result<()>;

    /// Lists every key currently on the server.
    fn keys(&self) -> Result<Vec<String>>;
}

// == Memcached Storage ==
/// Cache storage delegating to a memcached server.
#[derive(Debug)]
pub struct MemcachedStorage<C: RemoteClient = MemcachedClient> {
    client: C,
    /// Namespace prepended to every key
    prefix: String,
}

impl MemcachedStorage<MemcachedClient> {
    /// Connects lazily to the server at `addr` (`host:port`).
    pub fn connect(addr: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::with_client(MemcachedClient::new(addr), prefix)
    }
}

impl<C: RemoteClient> MemcachedStorage<C> {
    pub fn with_client(client: C, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn remote_key(&self, key: &str) -> String {
        encode_key(&format!("{}{}", self.prefix, key))
    }

    fn try_bulk_read(&self, keys: &[String]) -> Result<BulkResult> {
        let remote_keys: Vec<String> = keys.iter().map(|key| self.remote_key(key)).collect();
        let mut items = self.client.get_multi(&remote_keys)?;

        Ok(keys
            .iter()
            .zip(&remote_keys)
            .map(|(key, remote_key)| {
                let value = items.remove(remote_key).map(|item| CacheValue {
                    data: item.data,
                    serialized: item.flags & FLAG_SERIALIZED != 0,
                });
                (key.clone(), value)
            })
            .collect())
    }

    fn try_clean(&self, prefix: &str) -> Result<()> {
        if prefix.is_empty() && self.prefix.is_empty() {
            return self.client.flush();
        }

        let namespace = format!("{}{}", self.prefix, prefix);
        let mut removed = 0usize;
        for remote_key in self.client.keys()? {
            let matches = decode_key(&remote_key).is_some_and(|key| key.starts_with(&namespace));
            if matches {
                self.client.delete(&remote_key)?;
                removed += 1;
            }
        }
        debug!("Clean '{}' removed {} items", prefix, removed);
        Ok(())
    }
}

/// Converts a TTL into memcached's exptime.
fn exptime(ttl_secs: u64) -> u64 {
    if ttl_secs <= MAX_RELATIVE_EXPTIME {
        return ttl_secs;
    }
    expiry::expires_at(ttl_secs, expiry::now_secs())
        .and_then(|at| u64::try_from(at).ok())
        .unwrap_or(0)
}

impl<C: RemoteClient> Storage for MemcachedStorage<C> {
    fn read(&self, key: &str) -> Option<CacheValue> {
        let keys = [key.to_string()];
        match self.try_bulk_read(&keys) {
            Ok(mut result) => result.remove(key).flatten(),
            Err(e) => {
                warn!("Cache read of '{}' failed: {}", key, e);
                None
            }
        }
    }

    fn bulk_read(&self, keys: &[String]) -> BulkResult {
        self.try_bulk_read(keys).unwrap_or_else(|e| {
            warn!("Cache bulk read of {} keys failed: {}", keys.len(), e);
            keys.iter().map(|key| (key.clone(), None)).collect()
        })
    }

    fn lock(&self, _key: &str) {}

    fn write(&self, key: &str, value: CacheValue, ttl_secs: u64) {
        let item = RemoteItem {
            flags: if value.serialized { FLAG_SERIALIZED } else { 0 },
            data: value.data,
        };
        if let Err(e) = self.client.set(&self.remote_key(key), &item, exptime(ttl_secs)) {
            warn!("Cache write of '{}' failed: {}", key, e);
        }
    }

    fn remove(&self, key: &str) {
        if let Err(e) = self.client.delete(&self.remote_key(key)) {
            warn!("Cache remove of '{}' failed: {}", key, e);
        }
    }

    fn clean(&self, prefix: &str) {
        if let Err(e) = self.try_clean(prefix) {
            warn!("Cache clean of '{}' failed: {}", prefix, e);
        }
    }
}

// == Key Encoding ==
/// Percent-encodes everything outside `[A-Za-z0-9._~-]`.
pub fn encode_key(key: &str) -> String {
    urlencoding::encode(key).into_owned()
}

/// Reverses percent-encoding. Returns `None` if the result is not UTF-8.
pub fn decode_key(encoded: &str) -> Option<String> {
    urlencoding::decode(encoded).ok().map(|key| key.into_owned())
}

// == Memcached Client ==
/// Blocking client over the `memcache` crate. The connection pool is built
/// on first use, so a server that is down at startup does not fail `connect`.
pub struct MemcachedClient {
    addr: String,
    timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl fmt::Debug for MemcachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedClient")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl MemcachedClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: DEFAULT_TIMEOUT,
            client: Mutex::new(None),
        }
    }

    /// Sets the connect and I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn call<T>(&self, f: impl FnOnce(&Client) -> std::result::Result<T, MemcacheError>) -> Result<T> {
        let mut guard = self.client.lock();
        if guard.is_none() {
            let client = Client::builder()
                .add_server(format!("memcache://{}", self.addr))
                .and_then(|builder| {
                    builder
                        .with_connection_timeout(self.timeout)
                        .with_read_timeout(self.timeout)
                        .with_write_timeout(self.timeout)
                        .build()
                })
                .map_err(remote_error)?;
            debug!("Connected to memcached at {}", self.addr);
            *guard = Some(client);
        }
        match guard.as_ref() {
            Some(client) => f(client).map_err(remote_error),
            None => Err(CacheError::Internal("memcached client missing".to_string())),
        }
    }
}

fn remote_error(e: MemcacheError) -> CacheError {
    CacheError::Remote(e.to_string())
}

impl<W: Write> ToMemcacheValue<W> for &RemoteItem {
    fn get_flags(&self) -> u32 {
        self.flags
    }

    fn get_length(&self) -> usize {
        self.data.len()
    }

    fn write_to(&self, stream: &mut W) -> io::Result<()> {
        stream.write_all(&self.data)
    }
}

impl RemoteClient for MemcachedClient {
    fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, RemoteItem>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        let found: HashMap<String, (Vec<u8>, u32)> =
            self.call(|client| client.gets(&keys))?;

        Ok(found
            .into_iter()
            .map(|(key, (data, flags))| (key, RemoteItem { data, flags }))
            .collect())
    }

    fn set(&self, key: &str, item: &RemoteItem, exptime: u64) -> Result<()> {
        let exptime = u32::try_from(exptime)
            .map_err(|_| CacheError::Remote(format!("exptime {} out of range", exptime)))?;
        self.call(|client| client.set(key, item, exptime))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.call(|client| client.delete(key)).map(|_| ())
    }

    fn flush(&self) -> Result<()> {
        self.call(Client::flush)
    }

    fn keys(&self) -> Result<Vec<String>> {
        metadump_keys(&self.addr, self.timeout)
    }
}

// == Key Listing ==
/// Lists every key on the server with `lru_crawler metadump all`, which the
/// `memcache` crate does not expose.
fn metadump_keys(addr: &str, timeout: Duration) -> Result<Vec<String>> {
    let socket_addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;
    let mut stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(b"lru_crawler metadump all\r\n")?;

    let mut keys = Vec::new();
    for line in BufReader::new(stream).lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line == "END" {
            return Ok(keys);
        }
        // key=<uri-encoded key> exp=... la=... cas=... fetch=... cls=... size=...
        match line.split_ascii_whitespace().next().and_then(|f| f.strip_prefix("key=")) {
            Some(encoded) => keys.extend(decode_key(encoded)),
            None => return Err(CacheError::Remote(format!("unexpected reply '{}'", line))),
        }
    }
    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
}
