//! The uniform contract shared by every cache engine

use crate::errors::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Core trait implemented by the memory, file, and remote engines.
///
/// The contract is byte-oriented; typed access lives in the facade, which
/// frames values in the codec envelope before dispatch. Engines must
/// provide read-your-writes ordering for a single caller on a single key,
/// and `add` must be atomic (set-if-absent) on every implementation.
#[async_trait]
pub trait CacheEngine: Send + Sync + Debug {
    /// Stable engine name used by the selector and in logs
    fn name(&self) -> &'static str;

    /// Static performance rank, 1..=4, higher is faster
    fn performance_level(&self) -> u8;

    /// Whether the engine can currently serve requests
    async fn is_available(&self) -> bool;

    /// Fetch a value; expired entries are removed and read as absent
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value. `ttl == 0` stores without expiry. Always overwrites.
    async fn set(&self, key: &str, value: &[u8], ttl: u64) -> Result<()>;

    /// Remove a key; returns whether an entry existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Presence check with the same lazy-expiry semantics as `get`
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Store only if the key is absent; returns whether the write happened
    async fn add(&self, key: &str, value: &[u8], ttl: u64) -> Result<bool>;

    /// Atomic numeric update; fails with `TypeMismatch` when the existing
    /// value does not parse as a decimal integer
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Reset the expiry window; returns whether the key existed
    async fn touch(&self, key: &str, ttl: u64) -> Result<bool>;

    /// Drop every entry
    async fn clear(&self) -> Result<()>;

    /// Number of live entries
    async fn count(&self) -> Result<usize>;

    /// Sweep expired entries, returning how many were reclaimed
    async fn cleanup(&self) -> Result<usize>;

    /// Release held resources; called once when the selector shuts down.
    /// Engines without external resources keep the default no-op.
    async fn shutdown(&self) {}

    /// Batched get; the result mirrors the order of the requested keys.
    /// The default issues sequential single-key reads; engines with a real
    /// batched path override this.
    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.get(key).await?);
        }
        Ok(values)
    }

    /// Batched set; returns the number of entries stored
    async fn set_multiple(&self, entries: &[(String, Vec<u8>)], ttl: u64) -> Result<usize> {
        let mut stored = 0;
        for (key, value) in entries {
            if self.set(key, value, ttl).await.is_ok() {
                stored += 1;
            }
        }
        Ok(stored)
    }

    /// Batched delete; returns the number of entries removed
    async fn delete_multiple(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
