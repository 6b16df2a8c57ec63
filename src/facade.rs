//! The uniform cache contract
//!
//! Every caller-facing operation validates its key, resolves the best
//! engine through the selector, and dispatches. Engine faults are absorbed
//! by the soft-fail policy: the error counter is bumped, structured context
//! is logged, and the operation degrades (reads to miss, writes to "not
//! stored"). Two error classes propagate: `InvalidKey` (programmer error)
//! and `EngineUnavailable` (no engine can serve anything).

use crate::engine::CacheEngine;
use crate::errors::{CacheError, Result};
use crate::keys::validate_key;
use crate::selector::EngineSelector;
use crate::serialization::SerializerRegistry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// TTL accepted by facade operations: explicit seconds, a duration, or the
/// configured default
#[derive(Debug, Clone, Copy)]
pub enum Ttl {
    /// Use the configured default TTL
    Default,
    /// Explicit TTL in seconds; zero means no expiry
    Seconds(u64),
}

impl From<u64> for Ttl {
    fn from(seconds: u64) -> Self {
        Ttl::Seconds(seconds)
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl::Seconds(duration.as_secs())
    }
}

impl From<Option<u64>> for Ttl {
    fn from(seconds: Option<u64>) -> Self {
        match seconds {
            Some(seconds) => Ttl::Seconds(seconds),
            None => Ttl::Default,
        }
    }
}

/// Per-operation counters, maintained atomically
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of the facade's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
}

/// Uniform, validated entry point over the registered engines
pub struct Cache {
    selector: Arc<EngineSelector>,
    serializer: SerializerRegistry,
    default_ttl: u64,
    counters: Counters,
    /// In-process tag index: tag name to the keys written under it.
    /// Does not survive restart.
    tags: DashMap<String, HashSet<String>>,
}

impl Cache {
    pub fn new(selector: Arc<EngineSelector>, default_ttl: u64) -> Self {
        Cache {
            selector,
            serializer: SerializerRegistry::default(),
            default_ttl,
            counters: Counters::default(),
            tags: DashMap::new(),
        }
    }

    pub fn selector(&self) -> &Arc<EngineSelector> {
        &self.selector
    }

    /// Fetch and decode a value; any engine or decode fault reads as miss
    pub async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        validate_key(key)?;
        match self.get_raw(key).await? {
            Some(bytes) => match self.serializer.decode(key, &bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    self.note_error("get", key, &e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Fetch a value, or the provided default on miss
    pub async fn get_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Encode and store a value; returns whether the write happened
    pub async fn set<T>(&self, key: &str, value: &T, ttl: impl Into<Ttl>) -> Result<bool>
    where
        T: Serialize,
    {
        validate_key(key)?;
        let payload = match self.serializer.encode(key, value) {
            Ok(payload) => payload,
            Err(e) => {
                self.note_error("set", key, &e);
                return Ok(false);
            }
        };
        self.set_raw(key, &payload, self.resolve_ttl(ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.delete_raw(key).await
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let engine = self.engine()?;
        match engine.exists(key).await {
            Ok(present) => Ok(present),
            Err(e) => {
                self.note_error("has", key, &e);
                Ok(false)
            }
        }
    }

    pub async fn clear(&self) -> Result<bool> {
        let engine = self.engine()?;
        match engine.clear().await {
            Ok(()) => {
                self.tags.clear();
                Ok(true)
            }
            Err(e) => {
                self.note_error("clear", "*", &e);
                Ok(false)
            }
        }
    }

    /// Store only if absent; atomic on every engine
    pub async fn add<T>(&self, key: &str, value: &T, ttl: impl Into<Ttl>) -> Result<bool>
    where
        T: Serialize,
    {
        validate_key(key)?;
        let payload = match self.serializer.encode(key, value) {
            Ok(payload) => payload,
            Err(e) => {
                self.note_error("add", key, &e);
                return Ok(false);
            }
        };
        self.add_raw(key, &payload, self.resolve_ttl(ttl)).await
    }

    /// Store only if present
    pub async fn replace<T>(&self, key: &str, value: &T, ttl: impl Into<Ttl>) -> Result<bool>
    where
        T: Serialize,
    {
        let ttl = ttl.into();
        if !self.has(key).await? {
            return Ok(false);
        }
        self.set(key, value, ttl).await
    }

    /// Fetch and remove in one call
    pub async fn pull<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let value = self.get(key).await?;
        if value.is_some() {
            self.delete_raw(key).await?;
        }
        Ok(value)
    }

    /// Reset a key's expiry window
    pub async fn touch(&self, key: &str, ttl: impl Into<Ttl>) -> Result<bool> {
        validate_key(key)?;
        self.touch_raw(key, self.resolve_ttl(ttl)).await
    }

    /// Atomic numeric update over a raw (non-enveloped) counter entry.
    /// Counters live outside the codec envelope; read them back through
    /// `increment(key, 0)`. A non-numeric existing value reads as failure.
    pub async fn increment(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        validate_key(key)?;
        let engine = self.engine()?;
        match engine.increment(key, delta).await {
            Ok(value) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            Err(e) => {
                self.note_error("increment", key, &e);
                Ok(None)
            }
        }
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> Result<Option<i64>> {
        self.increment(key, -delta).await
    }

    /// Batched fetch; the result mirrors input order, with absent or
    /// undecodable entries as `None`
    pub async fn get_multiple<T>(&self, keys: &[String]) -> Result<Vec<Option<T>>>
    where
        T: DeserializeOwned,
    {
        for key in keys {
            validate_key(key)?;
        }
        let engine = self.engine()?;
        let raw = match engine.get_multiple(keys).await {
            Ok(raw) => raw,
            Err(e) => {
                self.note_error("get_multiple", "*", &e);
                vec![None; keys.len()]
            }
        };

        let mut values = Vec::with_capacity(keys.len());
        for (key, bytes) in keys.iter().zip(raw) {
            let value = bytes.and_then(|bytes| match self.serializer.decode(key, &bytes) {
                Ok(value) => Some(value),
                Err(e) => {
                    self.note_error("get_multiple", key, &e);
                    None
                }
            });
            if value.is_some() {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Batched store; returns how many entries were written
    pub async fn set_multiple<T>(
        &self,
        entries: &[(String, T)],
        ttl: impl Into<Ttl>,
    ) -> Result<usize>
    where
        T: Serialize,
    {
        let ttl = self.resolve_ttl(ttl);
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            validate_key(key)?;
            match self.serializer.encode(key, value) {
                Ok(payload) => encoded.push((key.clone(), payload)),
                Err(e) => self.note_error("set_multiple", key, &e),
            }
        }

        let engine = self.engine()?;
        match engine.set_multiple(&encoded, ttl).await {
            Ok(stored) => {
                self.counters.sets.fetch_add(stored as u64, Ordering::Relaxed);
                Ok(stored)
            }
            Err(e) => {
                self.note_error("set_multiple", "*", &e);
                Ok(0)
            }
        }
    }

    /// Batched delete; returns how many entries were removed
    pub async fn delete_multiple(&self, keys: &[String]) -> Result<usize> {
        for key in keys {
            validate_key(key)?;
        }
        let engine = self.engine()?;
        match engine.delete_multiple(keys).await {
            Ok(removed) => {
                self.counters
                    .deletes
                    .fetch_add(removed as u64, Ordering::Relaxed);
                Ok(removed)
            }
            Err(e) => {
                self.note_error("delete_multiple", "*", &e);
                Ok(0)
            }
        }
    }

    /// Return the cached value, or compute, store, and return it
    pub async fn remember<T, F, Fut>(
        &self,
        key: &str,
        ttl: impl Into<Ttl>,
        init: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let ttl = ttl.into();
        if let Some(cached) = self.get(key).await? {
            return Ok(cached);
        }
        let computed = init().await;
        // A failed store still hands the computed value back.
        self.set(key, &computed, ttl).await?;
        Ok(computed)
    }

    /// Store a value and index it under each tag for group invalidation
    pub async fn set_with_tags<T>(
        &self,
        key: &str,
        value: &T,
        tags: &[&str],
        ttl: impl Into<Ttl>,
    ) -> Result<bool>
    where
        T: Serialize,
    {
        let stored = self.set(key, value, ttl).await?;
        if stored {
            for tag in tags {
                self.tags
                    .entry((*tag).to_string())
                    .or_default()
                    .insert(key.to_string());
            }
        }
        Ok(stored)
    }

    /// Delete every key written under any of the given tags
    pub async fn invalidate_tags(&self, tags: &[&str]) -> Result<usize> {
        let mut keys: HashSet<String> = HashSet::new();
        for tag in tags {
            if let Some((_, tagged)) = self.tags.remove(*tag) {
                keys.extend(tagged);
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.into_iter().collect();
        self.delete_multiple(&keys).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }

    // Raw byte-level operations. These skip key validation: they carry
    // system-generated keys (the session layer's reserved namespace) that
    // use separators outside the caller-facing alphabet.

    pub(crate) async fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let engine = self.engine()?;
        match engine.get(key).await {
            Ok(Some(bytes)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(bytes))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Err(e) => {
                self.note_error("get", key, &e);
                Ok(None)
            }
        }
    }

    pub(crate) async fn set_raw(&self, key: &str, payload: &[u8], ttl: u64) -> Result<bool> {
        let engine = self.engine()?;
        match engine.set(key, payload, ttl).await {
            Ok(()) => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.note_error("set", key, &e);
                Ok(false)
            }
        }
    }

    pub(crate) async fn add_raw(&self, key: &str, payload: &[u8], ttl: u64) -> Result<bool> {
        let engine = self.engine()?;
        match engine.add(key, payload, ttl).await {
            Ok(added) => {
                if added {
                    self.counters.sets.fetch_add(1, Ordering::Relaxed);
                }
                Ok(added)
            }
            Err(e) => {
                self.note_error("add", key, &e);
                Ok(false)
            }
        }
    }

    pub(crate) async fn delete_raw(&self, key: &str) -> Result<bool> {
        let engine = self.engine()?;
        match engine.delete(key).await {
            Ok(removed) => {
                if removed {
                    self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                }
                Ok(removed)
            }
            Err(e) => {
                self.note_error("delete", key, &e);
                Ok(false)
            }
        }
    }

    pub(crate) async fn touch_raw(&self, key: &str, ttl: u64) -> Result<bool> {
        let engine = self.engine()?;
        match engine.touch(key, ttl).await {
            Ok(touched) => Ok(touched),
            Err(e) => {
                self.note_error("touch", key, &e);
                Ok(false)
            }
        }
    }

    fn engine(&self) -> Result<Arc<dyn CacheEngine>> {
        self.selector.best()
    }

    fn resolve_ttl(&self, ttl: impl Into<Ttl>) -> u64 {
        match ttl.into() {
            Ttl::Default => self.default_ttl,
            Ttl::Seconds(seconds) => seconds,
        }
    }

    fn note_error(&self, operation: &'static str, key: &str, error: &CacheError) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(operation, key, kind = error.kind(), error = %error, "cache operation degraded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use serde::Deserialize;
    use std::sync::atomic::AtomicU32;

    async fn memory_cache() -> Cache {
        let selector = Arc::new(EngineSelector::new(None));
        selector
            .register(Arc::new(MemoryEngine::default()) as Arc<dyn CacheEngine>)
            .await;
        Cache::new(selector, 3600)
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        visits: u32,
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let cache = memory_cache().await;
        let profile = Profile {
            name: "ada".to_string(),
            visits: 7,
        };

        assert!(cache.set("profile.ada", &profile, 60u64).await.unwrap());
        let loaded: Option<Profile> = cache.get("profile.ada").await.unwrap();
        assert_eq!(loaded, Some(profile));

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn invalid_keys_propagate() {
        let cache = memory_cache().await;
        let err = cache.get::<String>("bad:key").await.unwrap_err();
        assert_eq!(err.kind(), "InvalidKey");
        let err = cache.set("also/bad", &1u32, 60u64).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidKey");
    }

    #[tokio::test]
    async fn decode_mismatch_degrades_to_miss() {
        let cache = memory_cache().await;
        cache.set("k", &"a string", 60u64).await.unwrap();

        let wrong: Option<Profile> = cache.get("k").await.unwrap();
        assert_eq!(wrong, None);
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn add_replace_pull() {
        let cache = memory_cache().await;

        assert!(cache.add("k", &1u32, 60u64).await.unwrap());
        assert!(!cache.add("k", &2u32, 60u64).await.unwrap());
        assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(1));

        assert!(cache.replace("k", &3u32, 60u64).await.unwrap());
        assert!(!cache.replace("missing", &3u32, 60u64).await.unwrap());

        assert_eq!(cache.pull::<u32>("k").await.unwrap(), Some(3));
        assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_manages_raw_counters() {
        let cache = memory_cache().await;
        assert_eq!(cache.increment("hits", 2).await.unwrap(), Some(2));
        assert_eq!(cache.decrement("hits", 1).await.unwrap(), Some(1));
        assert_eq!(cache.increment("hits", 0).await.unwrap(), Some(1));

        // A typed value is not a counter.
        cache.set("text", &"words", 60u64).await.unwrap();
        assert_eq!(cache.increment("text", 1).await.unwrap(), None);
        assert!(cache.stats().errors >= 1);
    }

    #[tokio::test]
    async fn batch_operations_mirror_order() {
        let cache = memory_cache().await;
        let entries = vec![
            ("a".to_string(), 1u32),
            ("b".to_string(), 2u32),
            ("c".to_string(), 3u32),
        ];
        assert_eq!(cache.set_multiple(&entries, 60u64).await.unwrap(), 3);

        let keys = vec![
            "a".to_string(),
            "missing".to_string(),
            "c".to_string(),
        ];
        let values: Vec<Option<u32>> = cache.get_multiple(&keys).await.unwrap();
        assert_eq!(values, vec![Some(1), None, Some(3)]);

        assert_eq!(cache.delete_multiple(&keys).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn remember_computes_once() {
        let cache = memory_cache().await;
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let calls = &calls;
            let value: u32 = cache
                .remember("expensive", 60u64, move || async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    42u32
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn tag_invalidation_deletes_the_union() {
        let cache = memory_cache().await;
        cache
            .set_with_tags("user.1", &1u32, &["users", "active"], 60u64)
            .await
            .unwrap();
        cache
            .set_with_tags("user.2", &2u32, &["users"], 60u64)
            .await
            .unwrap();
        cache.set("other", &3u32, 60u64).await.unwrap();

        assert_eq!(cache.invalidate_tags(&["users"]).await.unwrap(), 2);
        assert_eq!(cache.get::<u32>("user.1").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("user.2").await.unwrap(), None);
        assert_eq!(cache.get::<u32>("other").await.unwrap(), Some(3));

        // The index was consumed; invalidating again is a no-op.
        assert_eq!(cache.invalidate_tags(&["users"]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ttl_accepts_durations_and_default() {
        let cache = memory_cache().await;
        assert!(cache
            .set("d", &1u32, Duration::from_secs(90))
            .await
            .unwrap());
        assert!(cache.set("n", &1u32, Ttl::Default).await.unwrap());
        assert_eq!(cache.default_ttl(), 3600);
    }

    #[tokio::test]
    async fn no_engines_propagates_unavailable() {
        let selector = Arc::new(EngineSelector::new(None));
        let cache = Cache::new(selector, 3600);
        let err = cache.get::<u32>("k").await.unwrap_err();
        assert_eq!(err.kind(), "EngineUnavailable");
    }
}
