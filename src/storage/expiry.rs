//! Expiration Policy
//!
//! Absolute expiry timestamps in Unix seconds. An expiry is computed once,
//! at write time, as `now + ttl`, and checked lazily whenever an entry is
//! read. There is no background sweep.

use chrono::Utc;

// == Utility Functions ==
/// Returns the current Unix timestamp in seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Absolute expiry for a TTL given in seconds, or `None` when the TTL is 0.
pub fn expires_at(ttl_secs: u64, now: i64) -> Option<i64> {
    if ttl_secs == 0 {
        return None;
    }
    let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    Some(now.saturating_add(ttl))
}

// == Is Valid ==
/// Checks whether an entry with the given expiry is still readable at `now`.
///
/// Entries without expiry never go stale. Otherwise the entry is valid
/// strictly before its expiry second: at `now == expires` it is stale.
pub fn is_valid(expires: Option<i64>, now: i64) -> bool {
    match expires {
        Some(expires) => expires > now,
        None => true,
    }
}
