//! Cache entry record shared by the memory and file engines

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed per-entry metadata overhead counted against the memory budget.
///
/// The value is part of the public contract: byte accounting is
/// `len(key) + len(value) + METADATA_OVERHEAD` per entry, so tests can size
/// budgets deterministically.
pub const METADATA_OVERHEAD: u64 = 1024;

/// The stored record for one cache key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub value: Vec<u8>,
    /// Seconds since epoch at creation; preserved across overwrites of the
    /// same logical record only where a layer explicitly carries it over
    pub created_at: u64,
    /// Seconds since epoch of the most recent read; drives LRU eviction
    pub accessed_at: u64,
    pub access_count: u64,
    /// Estimated footprint: key bytes + value bytes + metadata overhead
    pub size: u64,
    /// Absolute expiry in seconds since epoch; `None` means no expiry
    pub expires_at: Option<u64>,
    /// Insertion stamp; breaks `accessed_at` ties in eviction order
    #[serde(default)]
    pub seq: u64,
}

impl Entry {
    /// Build a fresh entry. `ttl == 0` means the entry never expires.
    pub fn new(value: Vec<u8>, key_len: usize, ttl: u64, now: u64) -> Self {
        let size = key_len as u64 + value.len() as u64 + METADATA_OVERHEAD;
        Entry {
            value,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            size,
            expires_at: expiry_for(ttl, now),
            seq: 0,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => now >= expires_at,
            None => false,
        }
    }

    /// Record a read: bump `accessed_at` and the access counter
    pub fn bump(&mut self, now: u64) {
        self.accessed_at = now.max(self.created_at);
        self.access_count += 1;
    }

    /// Reset the expiry window without touching the payload
    pub fn touch(&mut self, ttl: u64, now: u64) {
        self.expires_at = expiry_for(ttl, now);
    }
}

/// Translate a relative TTL into an absolute expiry timestamp
pub fn expiry_for(ttl: u64, now: u64) -> Option<u64> {
    if ttl == 0 {
        None
    } else {
        Some(now + ttl)
    }
}

/// Current wall-clock time in whole seconds since the Unix epoch
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ttl_never_expires() {
        let entry = Entry::new(b"v".to_vec(), 1, 0, 100);
        assert_eq!(entry.expires_at, None);
        assert!(!entry.is_expired(u64::MAX));
    }

    #[test]
    fn expiry_is_inclusive_at_deadline() {
        let entry = Entry::new(b"v".to_vec(), 1, 10, 100);
        assert_eq!(entry.expires_at, Some(110));
        assert!(!entry.is_expired(109));
        assert!(entry.is_expired(110));
    }

    #[test]
    fn size_accounts_for_key_value_and_overhead() {
        let entry = Entry::new(vec![0u8; 7], 3, 0, 100);
        assert_eq!(entry.size, 3 + 7 + METADATA_OVERHEAD);
    }

    #[test]
    fn bump_preserves_created_at_ordering() {
        let mut entry = Entry::new(b"v".to_vec(), 1, 0, 100);
        entry.bump(200);
        assert_eq!(entry.accessed_at, 200);
        assert_eq!(entry.access_count, 1);
        assert!(entry.created_at <= entry.accessed_at);
    }

    #[test]
    fn touch_resets_expiry() {
        let mut entry = Entry::new(b"v".to_vec(), 1, 10, 100);
        entry.touch(50, 120);
        assert_eq!(entry.expires_at, Some(170));
        entry.touch(0, 130);
        assert_eq!(entry.expires_at, None);
    }
}
