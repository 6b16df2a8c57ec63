//! Session storage with exclusive-write locking
//!
//! The cache contract becomes a mutual-exclusion primitive here: a lock is
//! a cache entry at `sess:lock:<sid>` whose value is the acquisition
//! timestamp and whose existence implies ownership. Acquisition spins on
//! the facade's atomic `add` with a 100 ms pause; the lock's own TTL equals
//! the acquisition timeout, so an abandoned owner's lock reclaims itself.

use crate::entry::unix_now;
use crate::errors::Result;
use crate::facade::Cache;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

/// Pause between lock acquisition attempts
const LOCK_RETRY_PAUSE: Duration = Duration::from_millis(100);

fn sid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Za-z0-9,-]{22,256}$").expect("valid sid pattern"))
}

/// Stored payload plus metadata for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub data: Vec<u8>,
    /// Preserved across successive writes for the same session id
    pub created_at: u64,
    pub updated_at: u64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Session handler backed by the cache facade
pub struct SessionStore {
    cache: Arc<Cache>,
    /// Session record TTL in seconds
    ttl: u64,
    /// Lock acquisition timeout in seconds; doubles as the lock TTL
    lock_timeout: u64,
    /// Locks this handler currently believes it owns: sid to acquired-at
    held_locks: DashMap<String, u64>,
    opened: AtomicBool,
}

impl SessionStore {
    pub fn new(cache: Arc<Cache>, ttl: u64, lock_timeout: u64) -> Self {
        SessionStore {
            cache,
            ttl,
            lock_timeout,
            held_locks: DashMap::new(),
            opened: AtomicBool::new(false),
        }
    }

    /// Handler protocol: begin a session sequence. The save path and name
    /// come from the surrounding runtime and are not used by this backend.
    pub fn open(&self, _save_path: &str, _name: &str) -> bool {
        self.opened.store(true, Ordering::Relaxed);
        true
    }

    /// Handler protocol: end the sequence, releasing any lock still held
    pub async fn close(&self) -> bool {
        let held: Vec<String> = self.held_locks.iter().map(|e| e.key().clone()).collect();
        for sid in held {
            self.unlock(&sid).await;
        }
        self.opened.store(false, Ordering::Relaxed);
        true
    }

    /// Acquire the exclusive lock for `sid`, spinning until `timeout_s`
    /// elapses. Returns whether the lock was acquired.
    pub async fn lock(&self, sid: &str, timeout_s: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_s);
        loop {
            let now = unix_now();
            let acquired = self
                .cache
                .add_raw(&lock_key(sid), now.to_string().as_bytes(), timeout_s)
                .await?;
            if acquired {
                self.held_locks.insert(sid.to_string(), now);
                tracing::debug!(sid, "session lock acquired");
                return Ok(true);
            }
            if tokio::time::Instant::now() + LOCK_RETRY_PAUSE > deadline {
                tracing::debug!(sid, timeout_s, "session lock acquisition timed out");
                return Ok(false);
            }
            tokio::time::sleep(LOCK_RETRY_PAUSE).await;
        }
    }

    /// Release the lock for `sid`
    pub async fn unlock(&self, sid: &str) -> bool {
        self.held_locks.remove(sid);
        self.cache
            .delete_raw(&lock_key(sid))
            .await
            .unwrap_or(false)
    }

    /// Handler protocol: read the session payload. The lock is acquired
    /// first; failure to acquire reads as an empty session.
    pub async fn read(&self, sid: &str) -> Result<Vec<u8>> {
        if !self.lock(sid, self.lock_timeout).await? {
            return Ok(Vec::new());
        }
        match self.load_record(sid).await? {
            Some(record) => Ok(record.data),
            None => Ok(Vec::new()),
        }
    }

    /// Handler protocol: upsert the session payload, preserving the
    /// original creation timestamp
    pub async fn write(&self, sid: &str, data: &[u8]) -> Result<bool> {
        let now = unix_now();
        let created_at = match self.load_record(sid).await? {
            Some(existing) => existing.created_at,
            None => now,
        };
        let record = SessionRecord {
            data: data.to_vec(),
            created_at,
            updated_at: now,
            ip_address: None,
            user_agent: None,
        };
        self.store_record(sid, &record).await
    }

    /// Handler protocol: remove the record and its lock
    pub async fn destroy(&self, sid: &str) -> bool {
        let removed = self
            .cache
            .delete_raw(&record_key(sid))
            .await
            .unwrap_or(false);
        self.unlock(sid).await;
        removed
    }

    /// Handler protocol: extend the record's TTL without rewriting it
    pub async fn update_timestamp(&self, sid: &str, _data: &[u8]) -> Result<bool> {
        self.cache.touch_raw(&record_key(sid), self.ttl).await
    }

    /// Handler protocol: garbage collection. Entries expire through their
    /// TTL, so expiry needs no sweep; what is reclaimed here are locks this
    /// handler still tracks past the lock timeout.
    pub async fn gc(&self, _max_lifetime: u64) -> usize {
        let now = unix_now();
        let stale: Vec<String> = self
            .held_locks
            .iter()
            .filter(|e| now.saturating_sub(*e.value()) > self.lock_timeout)
            .map(|e| e.key().clone())
            .collect();
        let reclaimed = stale.len();
        for sid in stale {
            tracing::debug!(sid, "releasing stale session lock");
            self.unlock(&sid).await;
        }
        reclaimed
    }

    /// Handler protocol: check a caller-supplied id before use
    pub fn validate_id(&self, sid: &str) -> bool {
        sid_pattern().is_match(sid)
    }

    /// Generate a fresh session id from 32 cryptographically random bytes.
    /// Base64 output is mapped onto the session alphabet (`+` to `,`,
    /// `/` to `-`) so generated ids always pass `validate_id`.
    pub fn create_sid(&self) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        STANDARD_NO_PAD
            .encode(bytes)
            .replace('+', ",")
            .replace('/', "-")
    }

    async fn load_record(&self, sid: &str) -> Result<Option<SessionRecord>> {
        let bytes = match self.cache.get_raw(&record_key(sid)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        match bincode::deserialize(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(sid, error = %e, "discarding undecodable session record");
                Ok(None)
            }
        }
    }

    async fn store_record(&self, sid: &str, record: &SessionRecord) -> Result<bool> {
        let bytes = match bincode::serialize(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(sid, error = %e, "session record serialization failed");
                return Ok(false);
            }
        };
        self.cache
            .set_raw(&record_key(sid), &bytes, self.ttl)
            .await
    }
}

fn record_key(sid: &str) -> String {
    format!("sess:{sid}")
}

fn lock_key(sid: &str) -> String {
    format!("sess:lock:{sid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CacheEngine;
    use crate::memory::MemoryEngine;
    use crate::selector::EngineSelector;

    async fn store() -> SessionStore {
        let selector = Arc::new(EngineSelector::new(None));
        selector
            .register(Arc::new(MemoryEngine::default()) as Arc<dyn CacheEngine>)
            .await;
        SessionStore::new(Arc::new(Cache::new(selector, 3600)), 1440, 5)
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let sessions = store().await;
        let sid = sessions.create_sid();

        assert!(sessions.open("/tmp", "PHPSESSID"));
        assert!(sessions.write(&sid, b"payload").await.unwrap());
        assert_eq!(sessions.read(&sid).await.unwrap(), b"payload".to_vec());
        assert!(sessions.close().await);
    }

    #[tokio::test]
    async fn missing_session_reads_empty() {
        let sessions = store().await;
        let sid = sessions.create_sid();
        assert!(sessions.read(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_preserves_created_at() {
        let sessions = store().await;
        let sid = sessions.create_sid();

        sessions.write(&sid, b"first").await.unwrap();
        let first = sessions.load_record(&sid).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        sessions.write(&sid, b"second").await.unwrap();
        let second = sessions.load_record(&sid).await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.data, b"second".to_vec());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let sessions = store().await;
        let sid = sessions.create_sid();

        assert!(sessions.lock(&sid, 5).await.unwrap());
        // A second acquisition with a short timeout loses.
        let start = tokio::time::Instant::now();
        assert!(!sessions.lock(&sid, 1).await.unwrap());
        assert!(start.elapsed() < Duration::from_millis(1200));

        assert!(sessions.unlock(&sid).await);
        assert!(sessions.lock(&sid, 5).await.unwrap());
    }

    #[tokio::test]
    async fn destroy_removes_record_and_lock() {
        let sessions = store().await;
        let sid = sessions.create_sid();

        sessions.write(&sid, b"data").await.unwrap();
        sessions.lock(&sid, 5).await.unwrap();
        assert!(sessions.destroy(&sid).await);
        assert!(sessions.read(&sid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_releases_stale_tracked_locks() {
        let sessions = {
            let selector = Arc::new(EngineSelector::new(None));
            selector
                .register(Arc::new(MemoryEngine::default()) as Arc<dyn CacheEngine>)
                .await;
            // Zero lock timeout: every tracked lock is instantly stale.
            SessionStore::new(Arc::new(Cache::new(selector, 3600)), 1440, 0)
        };
        let sid = sessions.create_sid();
        sessions.held_locks.insert(sid.clone(), 0);

        assert_eq!(sessions.gc(1440).await, 1);
        assert!(sessions.held_locks.is_empty());
    }

    #[test]
    fn generated_sids_validate() {
        let selector = Arc::new(EngineSelector::new(None));
        let sessions = SessionStore::new(Arc::new(Cache::new(selector, 3600)), 1440, 5);

        for _ in 0..32 {
            let sid = sessions.create_sid();
            assert!(sessions.validate_id(&sid), "generated sid {sid:?} invalid");
            assert_eq!(sid.len(), 43);
        }
    }

    #[test]
    fn id_validation_bounds() {
        let selector = Arc::new(EngineSelector::new(None));
        let sessions = SessionStore::new(Arc::new(Cache::new(selector, 3600)), 1440, 5);

        assert!(sessions.validate_id(&"a".repeat(22)));
        assert!(sessions.validate_id(&"a".repeat(256)));
        assert!(!sessions.validate_id(&"a".repeat(21)));
        assert!(!sessions.validate_id(&"a".repeat(257)));
        assert!(!sessions.validate_id("short"));
        assert!(!sessions.validate_id(&format!("{}!", "a".repeat(30))));
        assert!(sessions.validate_id("AZaz09,-AZaz09AZaz09AZaz"));
    }
}
