//! In-process cache engine with TTL and LRU eviction
//!
//! The store is a single mutex-guarded map with a running byte count.
//! Eviction is lazy: it runs only on the `set` whose projected footprint
//! would exceed the configured budget. Expiry sweeps run synchronously on
//! `get`/`set` whenever `cleanup_interval` has elapsed since the last sweep.

use crate::config::{parse_size_limit, MemoryConfig};
use crate::engine::CacheEngine;
use crate::entry::{unix_now, Entry};
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Share of keys reclaimed per eviction pass
const EVICTION_FRACTION: f64 = 0.10;

/// One stored entry plus its fine-grained recency stamp.
///
/// `Entry::accessed_at` has one-second resolution, which is too coarse to
/// order accesses within a burst; the `lru` tick is a per-store monotonic
/// counter bumped on every insert and hit, so eviction order is exact and
/// ties cannot occur (insertion order falls out of the tick naturally).
#[derive(Debug)]
struct Slot {
    entry: Entry,
    lru: u64,
}

#[derive(Debug, Default)]
struct Store {
    map: HashMap<String, Slot>,
    used_bytes: u64,
    tick: u64,
    last_cleanup: u64,
}

impl Store {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Remove every expired entry, returning how many were reclaimed
    fn sweep(&mut self, now: u64) -> usize {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(slot) = self.map.remove(key) {
                self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size);
            }
        }
        self.last_cleanup = now;
        expired.len()
    }
}

/// Counters kept by the memory engine itself
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

/// Point-in-time view of the engine's state
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub entry_count: usize,
    pub used_bytes: u64,
    pub budget: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

/// Thread-safe in-memory cache with TTL and LRU eviction
#[derive(Debug)]
pub struct MemoryEngine {
    store: Mutex<Store>,
    budget: u64,
    cleanup_interval: u64,
    counters: Counters,
}

impl MemoryEngine {
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_budget(config.max_size, config.cleanup_interval)
    }

    pub fn with_budget(budget: u64, cleanup_interval: u64) -> Self {
        MemoryEngine {
            store: Mutex::new(Store::default()),
            budget,
            cleanup_interval,
            counters: Counters::default(),
        }
    }

    /// Build from a `<int>{K,M,G}` limit string, falling back to the
    /// documented 100 MiB default when the string does not parse
    pub fn from_limit_str(limit: &str, cleanup_interval: u64) -> Self {
        let budget = parse_size_limit(limit).unwrap_or_else(|| {
            tracing::warn!(limit, "unparseable memory limit, using default");
            MemoryConfig::default().max_size
        });
        Self::with_budget(budget, cleanup_interval)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = unix_now();
        let mut store = self.store.lock();
        self.maybe_sweep(&mut store, now);

        let state = match store.map.get(key) {
            Some(slot) => Some(slot.entry.is_expired(now)),
            None => None,
        };
        match state {
            Some(true) => {
                if let Some(slot) = store.map.remove(key) {
                    store.used_bytes = store.used_bytes.saturating_sub(slot.entry.size);
                }
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Some(false) => {
                let tick = store.next_tick();
                let slot = store.map.get_mut(key).expect("entry present");
                slot.entry.bump(now);
                slot.lru = tick;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.entry.value.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: &[u8], ttl: u64) {
        let now = unix_now();
        let mut store = self.store.lock();
        self.maybe_sweep(&mut store, now);

        let entry = Entry::new(value.to_vec(), key.len(), ttl, now);
        self.insert(&mut store, key, entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut store = self.store.lock();
        match store.map.remove(key) {
            Some(slot) => {
                store.used_bytes = store.used_bytes.saturating_sub(slot.entry.size);
                true
            }
            None => false,
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = unix_now();
        let mut store = self.store.lock();
        let state = match store.map.get(key) {
            Some(slot) => Some(slot.entry.is_expired(now)),
            None => None,
        };
        match state {
            Some(true) => {
                if let Some(slot) = store.map.remove(key) {
                    store.used_bytes = store.used_bytes.saturating_sub(slot.entry.size);
                }
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Set-if-absent, atomic under the store mutex
    pub fn add(&self, key: &str, value: &[u8], ttl: u64) -> bool {
        let now = unix_now();
        let mut store = self.store.lock();

        let live = match store.map.get(key) {
            Some(slot) => !slot.entry.is_expired(now),
            None => false,
        };
        if live {
            return false;
        }

        let entry = Entry::new(value.to_vec(), key.len(), ttl, now);
        self.insert(&mut store, key, entry);
        true
    }

    /// Atomic numeric update; absent keys start from zero
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let now = unix_now();
        let mut store = self.store.lock();

        let (current, created_at, expires_at) = match store.map.get(key) {
            Some(slot) if !slot.entry.is_expired(now) => {
                let text = std::str::from_utf8(&slot.entry.value)
                    .map_err(|_| self.type_mismatch(key, "value is not UTF-8"))?;
                let parsed: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| self.type_mismatch(key, "value is not an integer"))?;
                (parsed, slot.entry.created_at, slot.entry.expires_at)
            }
            _ => (0, now, None),
        };

        let updated = current.wrapping_add(delta);
        let value = updated.to_string().into_bytes();
        let mut entry = Entry::new(value, key.len(), 0, now);
        entry.created_at = created_at;
        entry.expires_at = expires_at;
        self.insert(&mut store, key, entry);
        Ok(updated)
    }

    pub fn decrement(&self, key: &str, delta: i64) -> Result<i64> {
        self.increment(key, -delta)
    }

    pub fn touch(&self, key: &str, ttl: u64) -> bool {
        let now = unix_now();
        let mut store = self.store.lock();
        match store.map.get_mut(key) {
            Some(slot) if !slot.entry.is_expired(now) => {
                slot.entry.touch(ttl, now);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.map.clear();
        store.used_bytes = 0;
    }

    /// Live entries only; unswept expired entries do not count
    pub fn count(&self) -> usize {
        let now = unix_now();
        let store = self.store.lock();
        store
            .map
            .values()
            .filter(|slot| !slot.entry.is_expired(now))
            .count()
    }

    /// Sweep all expired entries now, regardless of the cleanup interval
    pub fn cleanup(&self) -> usize {
        let now = unix_now();
        let mut store = self.store.lock();
        let reclaimed = store.sweep(now);
        self.counters
            .expired
            .fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    pub fn get_multiple(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    pub fn set_multiple(&self, entries: &[(String, Vec<u8>)], ttl: u64) -> usize {
        for (key, value) in entries {
            self.set(key, value, ttl);
        }
        entries.len()
    }

    pub fn delete_multiple(&self, keys: &[String]) -> usize {
        keys.iter().filter(|key| self.delete(key)).count()
    }

    pub fn stats(&self) -> MemoryStats {
        let store = self.store.lock();
        MemoryStats {
            entry_count: store.map.len(),
            used_bytes: store.used_bytes,
            budget: self.budget,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    fn maybe_sweep(&self, store: &mut Store, now: u64) {
        if now.saturating_sub(store.last_cleanup) >= self.cleanup_interval {
            let reclaimed = store.sweep(now);
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "periodic expiry sweep");
                self.counters
                    .expired
                    .fetch_add(reclaimed as u64, Ordering::Relaxed);
            }
        }
    }

    /// Insert with eviction when the projection exceeds the budget
    fn insert(&self, store: &mut Store, key: &str, mut entry: Entry) {
        if store.used_bytes + entry.size > self.budget {
            self.evict(store);
        }

        let tick = store.next_tick();
        entry.seq = tick;
        let slot = Slot { entry, lru: tick };
        let added = slot.entry.size;
        if let Some(previous) = store.map.insert(key.to_string(), slot) {
            store.used_bytes = store.used_bytes.saturating_sub(previous.entry.size);
        }
        store.used_bytes += added;
    }

    /// Drop the least-recently-used tenth of the keys (at least one)
    fn evict(&self, store: &mut Store) {
        if store.map.is_empty() {
            return;
        }

        let mut order: Vec<(u64, String)> = store
            .map
            .iter()
            .map(|(key, slot)| (slot.lru, key.clone()))
            .collect();
        order.sort_unstable();

        let victims = ((order.len() as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        for (_, key) in order.into_iter().take(victims) {
            if let Some(slot) = store.map.remove(&key) {
                store.used_bytes = store.used_bytes.saturating_sub(slot.entry.size);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "evicted least-recently-used entry");
            }
        }
    }

    fn type_mismatch(&self, key: &str, detail: &str) -> CacheError {
        CacheError::TypeMismatch {
            key: key.to_string(),
            detail: detail.to_string(),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(&MemoryConfig::default())
    }
}

#[async_trait]
impl CacheEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn performance_level(&self) -> u8 {
        4
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(MemoryEngine::get(self, key))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: u64) -> Result<()> {
        MemoryEngine::set(self, key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(MemoryEngine::delete(self, key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(MemoryEngine::exists(self, key))
    }

    async fn add(&self, key: &str, value: &[u8], ttl: u64) -> Result<bool> {
        Ok(MemoryEngine::add(self, key, value, ttl))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        MemoryEngine::increment(self, key, delta)
    }

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        Ok(MemoryEngine::touch(self, key, ttl))
    }

    async fn clear(&self) -> Result<()> {
        MemoryEngine::clear(self);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(MemoryEngine::count(self))
    }

    async fn cleanup(&self) -> Result<usize> {
        Ok(MemoryEngine::cleanup(self))
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(MemoryEngine::get_multiple(self, keys))
    }

    async fn set_multiple(&self, entries: &[(String, Vec<u8>)], ttl: u64) -> Result<usize> {
        Ok(MemoryEngine::set_multiple(self, entries, ttl))
    }

    async fn delete_multiple(&self, keys: &[String]) -> Result<usize> {
        Ok(MemoryEngine::delete_multiple(self, keys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::METADATA_OVERHEAD;
    use std::sync::Arc;
    use std::time::Duration;

    fn unbounded() -> MemoryEngine {
        MemoryEngine::with_budget(u64::MAX, 300)
    }

    /// Budget sized to hold exactly `n` entries of 1-byte key + 1-byte value
    fn budget_for(n: u64) -> u64 {
        n * (1 + 1 + METADATA_OVERHEAD)
    }

    #[test]
    fn round_trip_until_delete() {
        let engine = unbounded();
        engine.set("k", b"v", 0);
        assert_eq!(engine.get("k"), Some(b"v".to_vec()));
        assert!(engine.delete("k"));
        assert_eq!(engine.get("k"), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let engine = unbounded();
        engine.set("k", b"v", 0);
        assert!(engine.delete("k"));
        assert!(!engine.delete("k"));
    }

    #[test]
    fn set_overwrites_and_adjusts_usage() {
        let engine = unbounded();
        engine.set("k", b"first", 0);
        engine.set("k", b"second value", 0);
        assert_eq!(engine.get("k"), Some(b"second value".to_vec()));

        let stats = engine.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(
            stats.used_bytes,
            1 + b"second value".len() as u64 + METADATA_OVERHEAD
        );
    }

    #[test]
    fn ttl_expiry_reads_as_absent_and_leaves_count() {
        let engine = unbounded();
        engine.set("x", b"v", 1);
        engine.set("y", b"v", 100);
        assert_eq!(engine.count(), 2);

        std::thread::sleep(Duration::from_secs(2));
        assert_eq!(engine.get("x"), None);
        assert_eq!(engine.get("y"), Some(b"v".to_vec()));
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn cleanup_sweeps_expired_entries() {
        let engine = unbounded();
        engine.set("x", b"v", 1);
        engine.set("y", b"v", 100);

        std::thread::sleep(Duration::from_secs(2));
        let reclaimed = engine.cleanup();
        assert!(reclaimed >= 1);
        assert_eq!(engine.get("x"), None);
        assert_eq!(engine.get("y"), Some(b"v".to_vec()));
    }

    #[test]
    fn lru_eviction_prefers_oldest_access() {
        // Budget holds exactly three entries; a fourth insert must evict.
        let engine = MemoryEngine::with_budget(budget_for(3), 300);
        engine.set("a", b"1", 0);
        engine.set("b", b"2", 0);
        engine.set("c", b"3", 0);

        // Refresh "a" so "b" becomes the least recently used.
        assert_eq!(engine.get("a"), Some(b"1".to_vec()));

        engine.set("d", b"4", 0);
        assert!(engine.get("a").is_some());
        assert!(engine.get("b").is_none());
        assert!(engine.get("c").is_some());
        assert!(engine.get("d").is_some());
        assert_eq!(engine.stats().evictions, 1);
    }

    #[test]
    fn eviction_reclaims_at_least_one_entry() {
        let engine = MemoryEngine::with_budget(budget_for(2), 300);
        engine.set("a", b"1", 0);
        engine.set("b", b"2", 0);
        engine.set("c", b"3", 0);

        // Two keys at 10% rounds up to one eviction: the oldest.
        assert!(engine.get("a").is_none());
        assert_eq!(engine.count(), 2);
    }

    #[test]
    fn add_is_exclusive_while_live() {
        let engine = unbounded();
        assert!(engine.add("k", b"first", 10));
        assert!(!engine.add("k", b"second", 10));
        assert_eq!(engine.get("k"), Some(b"first".to_vec()));
    }

    #[test]
    fn add_succeeds_over_expired_entry() {
        let engine = unbounded();
        engine.set("k", b"old", 1);
        std::thread::sleep(Duration::from_secs(2));
        assert!(engine.add("k", b"new", 0));
        assert_eq!(engine.get("k"), Some(b"new".to_vec()));
    }

    #[test]
    fn concurrent_adds_admit_exactly_one() {
        let engine = Arc::new(unbounded());
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                engine.add("lock", format!("owner-{i}").as_bytes(), 10)
            }));
        }
        let won: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(won, 1);
    }

    #[test]
    fn increment_starts_from_zero() {
        let engine = unbounded();
        assert_eq!(engine.increment("n", 5).unwrap(), 5);
        assert_eq!(engine.increment("n", 3).unwrap(), 8);
        assert_eq!(engine.decrement("n", 10).unwrap(), -2);
        assert_eq!(engine.get("n"), Some(b"-2".to_vec()));
    }

    #[test]
    fn increment_preserves_expiry_and_creation() {
        let engine = unbounded();
        engine.set("n", b"1", 100);
        let before = {
            let store = engine.store.lock();
            let slot = &store.map["n"];
            (slot.entry.created_at, slot.entry.expires_at)
        };

        engine.increment("n", 1).unwrap();
        let store = engine.store.lock();
        let slot = &store.map["n"];
        assert_eq!(slot.entry.created_at, before.0);
        assert_eq!(slot.entry.expires_at, before.1);
    }

    #[test]
    fn increment_rejects_non_numeric() {
        let engine = unbounded();
        engine.set("s", b"not a number", 0);
        let err = engine.increment("s", 1).unwrap_err();
        assert_eq!(err.kind(), "TypeMismatch");
        // The original value is untouched.
        assert_eq!(engine.get("s"), Some(b"not a number".to_vec()));
    }

    #[test]
    fn touch_extends_live_entries_only() {
        let engine = unbounded();
        engine.set("k", b"v", 100);
        assert!(engine.touch("k", 200));
        assert!(!engine.touch("missing", 200));
    }

    #[test]
    fn get_multiple_mirrors_request_order() {
        let engine = unbounded();
        engine.set("a", b"1", 0);
        engine.set("c", b"3", 0);

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = engine.get_multiple(&keys);
        assert_eq!(
            values,
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
        );
    }

    #[test]
    fn clear_drops_everything() {
        let engine = unbounded();
        engine.set("a", b"1", 0);
        engine.set("b", b"2", 0);
        engine.clear();
        assert_eq!(engine.count(), 0);
        assert_eq!(engine.stats().used_bytes, 0);
    }

    #[test]
    fn limit_string_constructor() {
        let engine = MemoryEngine::from_limit_str("1M", 300);
        assert_eq!(engine.budget(), 1024 * 1024);

        let fallback = MemoryEngine::from_limit_str("garbage", 300);
        assert_eq!(fallback.budget(), 100 * 1024 * 1024);
    }
}
