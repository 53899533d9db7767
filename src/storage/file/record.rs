//! Record Codec
//!
//! On-disk layout of one cache entry:
//!
//! ```text
//! [header length: u32 little-endian][metadata: JSON object][payload bytes to EOF]
//! ```
//!
//! The metadata block is versioned independently of whatever codec produced
//! the payload; the payload itself is never interpreted here.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Width of the header length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Metadata blocks larger than this are treated as corruption.
pub const MAX_HEADER_LEN: u32 = 64 * 1024;

/// Record format version written by this crate.
pub const RECORD_VERSION: u8 = 1;

// == Record Metadata ==
/// Metadata stored in front of every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Record format version
    #[serde(rename = "v", default = "default_version")]
    pub version: u8,
    /// Absolute expiry (Unix seconds); `None` = never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
    /// Payload was produced by a value codec
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub serialized: bool,
}

fn default_version() -> u8 {
    RECORD_VERSION
}

impl RecordMeta {
    pub fn new(expires: Option<i64>, serialized: bool) -> Self {
        Self {
            version: RECORD_VERSION,
            expires,
            serialized,
        }
    }
}

// == Encode ==
/// Serializes metadata and payload into a single record buffer.
pub fn encode(meta: &RecordMeta, payload: &[u8]) -> Result<Vec<u8>> {
    let header = serde_json::to_vec(meta)?;
    let header_len = u32::try_from(header.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or_else(|| CacheError::MalformedRecord("metadata block too large".to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + header.len() + payload.len());
    buf.extend_from_slice(&header_len.to_le_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    Ok(buf)
}

// == Decode ==
/// Reads the length prefix and metadata block, leaving `reader` positioned at
/// the start of the payload.
///
/// A short length prefix, a metadata block shorter than announced, an
/// unparsable block, or a version newer than [`RECORD_VERSION`] all report
/// [`CacheError::MalformedRecord`].
pub fn read_meta<R: Read>(reader: &mut R) -> Result<RecordMeta> {
    let mut len_buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut len_buf)
        .map_err(|_| CacheError::MalformedRecord("truncated length prefix".to_string()))?;

    let header_len = u32::from_le_bytes(len_buf);
    if header_len > MAX_HEADER_LEN {
        return Err(CacheError::MalformedRecord(format!(
            "metadata length {} exceeds {}",
            header_len, MAX_HEADER_LEN
        )));
    }

    let mut header = vec![0u8; header_len as usize];
    reader
        .read_exact(&mut header)
        .map_err(|_| CacheError::MalformedRecord("truncated metadata block".to_string()))?;

    let meta: RecordMeta = serde_json::from_slice(&header)
        .map_err(|e| CacheError::MalformedRecord(format!("metadata: {}", e)))?;
    if meta.version > RECORD_VERSION {
        return Err(CacheError::MalformedRecord(format!(
            "unsupported record version {}",
            meta.version
        )));
    }
    Ok(meta)
}

/// Decodes a whole record held in memory.
pub fn decode(bytes: &[u8]) -> Result<(RecordMeta, &[u8])> {
    let mut cursor = bytes;
    let meta = read_meta(&mut cursor)?;
    Ok((meta, cursor))
}
