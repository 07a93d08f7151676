//! Two-tier key/value cache: memory in front of SQLite.
//!
//! The tiered cache is the central cache type of the engine. It:
//! - Serves reads from the memory tier, then the persistent tier
//! - Writes through to both tiers
//! - Compresses large values on their way to disk
//! - Fails open: storage errors are logged and reported as misses
//!
//! A gate lock keeps deletes, clears and maintenance from interleaving
//! with reads, so a reader never sees a value removed from only one tier.
//! Writers bump a counter under the memory lock; a read only copies a disk
//! value into memory if no write happened since it started.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::compressor::Compressor;
use crate::cache::entry::{now_millis, CacheKey};
use crate::cache::evictor::{Evictor, MaintenanceReport};
use crate::cache::memory::MemoryTier;
use crate::config::{CacheConfig, CompressionConfig};
use crate::storage::{PersistentTier, StoreError};

/// Hit/miss counters and tier sizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub persistent_entries: usize,
    pub persistent_capacity: usize,
}

impl CacheStats {
    /// Hit rate as a fraction (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Memory cache size: {} entries\nDatabase cache size: {} entries\nHits: {}\nMisses: {}\nHit rate: {:.1}%",
            self.memory_entries,
            self.persistent_entries,
            self.hits,
            self.misses,
            self.hit_rate() * 100.0
        )
    }
}

/// Memory + persistent cache of string values.
pub struct TieredCache {
    name: String,
    memory: Mutex<MemoryTier>,
    store: PersistentTier,
    compressor: Compressor,
    evictor: Evictor,
    gate: RwLock<()>,
    /// Bumped by every `put` while it holds the memory lock.
    writes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn open(
        name: impl Into<String>,
        cache: &CacheConfig,
        compression: CompressionConfig,
        store: PersistentTier,
    ) -> Self {
        Self {
            name: name.into(),
            memory: Mutex::new(MemoryTier::new(cache.memory_capacity)),
            store,
            compressor: Compressor::new(compression),
            evictor: Evictor::from_config(cache),
            gate: RwLock::new(()),
            writes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache backed by a private in-memory database.
    pub async fn in_memory(
        name: impl Into<String>,
        cache: &CacheConfig,
        compression: CompressionConfig,
    ) -> Result<Self, StoreError> {
        let store = PersistentTier::open_in_memory().await?;
        Ok(Self::open(name, cache, compression, store))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direct handle to the persistent tier.
    pub fn store(&self) -> &PersistentTier {
        &self.store
    }

    /// Look up `key`, memory tier first.
    ///
    /// A persistent hit is decompressed, copied into the memory tier and its
    /// timestamp refreshed. Storage errors and corrupt payloads read as a miss;
    /// a corrupt row is deleted so it does not fail again.
    pub async fn get(&self, key: &str) -> Option<String> {
        let _gate = self.gate.read().await;

        let writes_seen = {
            let memory = self.memory.lock().await;
            if let Some(value) = memory.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            self.writes.load(Ordering::SeqCst)
        };

        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(e) => {
                warn!(cache = %self.name, key, error = %e, "Persistent tier read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let decoded = self
            .compressor
            .decode(&entry.value)
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()));

        let value = match decoded {
            Ok(value) => value,
            Err(reason) => {
                warn!(cache = %self.name, key, reason = %reason, "Corrupt cache entry, deleting");
                // Held across the delete so a concurrent put cannot land in between.
                let _memory = self.memory.lock().await;
                if self.writes.load(Ordering::SeqCst) == writes_seen {
                    if let Err(e) = self.store.delete(key).await {
                        warn!(cache = %self.name, key, error = %e, "Failed to delete corrupt entry");
                    }
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        {
            // A put that ran meanwhile owns the memory slot; keep its value.
            let mut memory = self.memory.lock().await;
            if self.writes.load(Ordering::SeqCst) == writes_seen {
                memory.insert_if_absent(key, &value);
            }
        }
        if let Err(e) = self.store.touch(key, now_millis()).await {
            debug!(cache = %self.name, key, error = %e, "Failed to refresh entry timestamp");
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Whether `key` is cached in either tier. Does not touch the hit counters.
    pub async fn contains(&self, key: &str) -> bool {
        let _gate = self.gate.read().await;
        if self.memory.lock().await.contains(key) {
            return true;
        }
        match self.store.exists(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(cache = %self.name, key, error = %e, "Persistent tier lookup failed");
                false
            }
        }
    }

    /// Write `value` to both tiers, replacing any previous value.
    pub async fn put(&self, key: &str, value: &str) {
        let _gate = self.gate.read().await;

        let evicted = {
            let mut memory = self.memory.lock().await;
            self.writes.fetch_add(1, Ordering::SeqCst);
            memory.insert(key.to_string(), value.to_string())
        };
        if let Some(evicted) = evicted {
            debug!(cache = %self.name, evicted = %evicted, "Memory tier full, evicted oldest entry");
        }

        let framed = self.compressor.encode(value.as_bytes());
        if let Err(e) = self.store.upsert(key, framed, now_millis()).await {
            warn!(cache = %self.name, key, error = %e, "Persistent tier write failed");
        }
    }

    /// Remove `key` from both tiers.
    pub async fn delete(&self, key: &str) {
        let _gate = self.gate.write().await;
        self.memory.lock().await.remove(key);
        if let Err(e) = self.store.delete(key).await {
            warn!(cache = %self.name, key, error = %e, "Persistent tier delete failed");
        }
    }

    /// Remove every key starting with `prefix` from both tiers.
    pub async fn remove_prefix(&self, prefix: &str) -> usize {
        let _gate = self.gate.write().await;
        let in_memory = self.memory.lock().await.remove_prefix(prefix);
        match self.store.delete_prefix(prefix).await {
            Ok(n) => n.max(in_memory),
            Err(e) => {
                warn!(cache = %self.name, prefix, error = %e, "Persistent tier prefix delete failed");
                in_memory
            }
        }
    }

    /// Empty both tiers and reset the hit/miss counters.
    pub async fn clear(&self) {
        let _gate = self.gate.write().await;
        self.memory.lock().await.clear();
        if let Err(e) = self.store.clear().await {
            warn!(cache = %self.name, error = %e, "Persistent tier clear failed");
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!(cache = %self.name, "Cache cleared");
    }

    /// Drop expired and excess persistent entries.
    ///
    /// Holds the gate exclusively for the duration. Keys removed from disk are
    /// dropped from the memory tier as well.
    pub async fn maintenance(&self) -> Result<MaintenanceReport, StoreError> {
        let _gate = self.gate.write().await;
        let report = self.store.run_maintenance(self.evictor, now_millis()).await?;

        if !report.removed_keys.is_empty() {
            let mut memory = self.memory.lock().await;
            for key in &report.removed_keys {
                memory.remove(key);
            }
        }

        info!(
            cache = %self.name,
            expired = report.expired,
            trimmed = report.trimmed,
            "Maintenance pass finished"
        );
        Ok(report)
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_capacity) = {
            let memory = self.memory.lock().await;
            (memory.len(), memory.capacity())
        };
        let persistent_entries = match self.store.count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(cache = %self.name, error = %e, "Failed to count persistent entries");
                0
            }
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            memory_entries,
            memory_capacity,
            persistent_entries,
            persistent_capacity: self.evictor.capacity(),
        }
    }

    /// Save the translation state blob for a message.
    pub async fn save_message_state(&self, message_id: i64, state: &str) {
        self.put(&CacheKey::message_state(message_id), state).await;
    }

    pub async fn message_state(&self, message_id: i64) -> Option<String> {
        self.get(&CacheKey::message_state(message_id)).await
    }

    pub async fn clear_message_state(&self, message_id: i64) {
        self.delete(&CacheKey::message_state(message_id)).await;
    }
}

/// Thread-safe handle to a tiered cache.
pub type SharedCache = Arc<TieredCache>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache_with(memory_capacity: usize) -> TieredCache {
        let config = CacheConfig {
            memory_capacity,
            ..Default::default()
        };
        TieredCache::in_memory("test", &config, CompressionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache_with(10).await;
        cache.put("hello_es", "Hola").await;
        assert_eq!(cache.get("hello_es").await.as_deref(), Some("Hola"));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.persistent_entries, 1);
    }

    #[tokio::test]
    async fn test_persistent_hit_repopulates_memory() {
        let cache = cache_with(1).await;
        cache.put("a", "1").await;
        cache.put("b", "2").await; // evicts "a" from memory only

        assert_eq!(cache.stats().await.memory_entries, 1);
        assert_eq!(cache.get("a").await.as_deref(), Some("1"));
        assert!(cache.memory.lock().await.contains("a"));
    }

    #[tokio::test]
    async fn test_large_value_roundtrip() {
        let cache = cache_with(0).await;
        let value = "bonjour le monde ".repeat(500);
        cache.put("big", &value).await;

        let stored = cache.store().get("big").await.unwrap().unwrap();
        assert!(stored.value.len() < value.len());
        assert_eq!(cache.get("big").await.as_deref(), Some(value.as_str()));
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_miss_and_deleted() {
        let cache = cache_with(0).await;
        cache.store().upsert("bad", vec![1, 255, 255, 0, 0, 9, 9], now_millis()).await.unwrap();

        assert_eq!(cache.get("bad").await, None);
        assert!(!cache.store().exists("bad").await.unwrap());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_clear_empties_both_tiers() {
        let cache = cache_with(10).await;
        cache.put("hello_es", "Hola").await;
        cache.clear().await;

        assert_eq!(cache.get("hello_es").await, None);
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.persistent_entries, 0);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_message_state_helpers() {
        let cache = cache_with(10).await;
        cache.save_message_state(5, r#"{"translated":true}"#).await;
        assert_eq!(cache.message_state(5).await.as_deref(), Some(r#"{"translated":true}"#));
        cache.clear_message_state(5).await;
        assert_eq!(cache.message_state(5).await, None);
    }

    #[test]
    fn test_stats_display() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!(stats.to_string().contains("Hit rate: 75.0%"));
    }
}
