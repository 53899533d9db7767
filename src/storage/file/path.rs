//! Path Resolver
//!
//! Maps cache keys onto files under the base directory. The key separator
//! `-` becomes a directory boundary, so `user-42-profile` lives at
//! `<base>/user/42/profile`.

use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

/// Character that splits a key into nested directory segments.
pub const KEY_SEPARATOR: char = '-';

// == Prefix Pattern ==
/// A clean prefix resolved to a directory plus a file-name stem.
///
/// Equivalent to the glob `<dir>/<stem>*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixPattern {
    /// Directory whose entries are matched
    pub dir: PathBuf,
    /// Leading part of the entry name; empty matches everything in `dir`
    pub stem: String,
}

impl PrefixPattern {
    /// Returns true if an entry named `name` inside `dir` matches.
    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.stem)
    }
}

// == Path Resolver ==
/// Pure mapping from `(base directory, key)` to a path. Does no I/O.
#[derive(Debug, Clone)]
pub struct PathResolver {
    base: PathBuf,
}

impl PathResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves a key to the path of its record file.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        validate(key, false)?;
        Ok(self.join_segments(key.split(KEY_SEPARATOR)))
    }

    /// Resolves a non-empty clean prefix.
    ///
    /// `a-b` matches `<base>/a/b*`; `a-` matches everything in `<base>/a`.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<PrefixPattern> {
        validate(prefix, true)?;
        let mut segments: Vec<&str> = prefix.split(KEY_SEPARATOR).collect();
        // validate() guarantees at least one segment
        let stem = segments.pop().unwrap_or_default().to_string();
        Ok(PrefixPattern {
            dir: self.join_segments(segments.into_iter()),
            stem,
        })
    }

    fn join_segments<'a>(&self, segments: impl Iterator<Item = &'a str>) -> PathBuf {
        let mut path = self.base.clone();
        for segment in segments {
            path.push(segment);
        }
        path
    }
}

// == Key Validation ==
/// Rejects keys that cannot be mapped safely under the base directory.
///
/// With `allow_trailing_separator`, a final empty segment (`a-`) is accepted;
/// clean prefixes use that to address a whole directory.
fn validate(key: &str, allow_trailing_separator: bool) -> Result<()> {
    let invalid = |reason| CacheError::InvalidKey {
        key: key.to_string(),
        reason,
    };

    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.contains(['/', '\\', '\0']) {
        return Err(invalid("key contains a path separator or NUL"));
    }

    let segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "" if i == last && allow_trailing_separator && last > 0 => {}
            "" => return Err(invalid("key has an empty segment")),
            "." | ".." => return Err(invalid("key has a relative segment")),
            _ => {}
        }
    }
    Ok(())
}
