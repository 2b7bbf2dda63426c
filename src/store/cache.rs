use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::store::traits::Storage;

/// Prefix separating cache records from other collaborator keys (optimistic
/// resources live under `<type>:<id>`).
const STORAGE_PREFIX: &str = "cache:";

#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Per-entry TTL; falls back to the configured default when `None`.
    pub ttl: Option<Duration>,
    /// Labels for bulk invalidation; never used for eviction ordering.
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn tagged(tags: Vec<String>) -> Self {
        Self { ttl: None, tags }
    }
}

/// Tier-one entry. Expired once `created.elapsed() > ttl`, so a zero TTL is
/// dead on the next read.
#[derive(Debug, Clone)]
struct TierOneEntry {
    value: Value,
    created: Instant,
    ttl: Duration,
    tags: HashSet<String>,
    size: usize,
}

impl TierOneEntry {
    fn expired(&self) -> bool {
        self.created.elapsed() > self.ttl
    }
}

/// Tier-two record as persisted through the storage collaborator. Wall-clock
/// timestamps so expiry survives the serialization round-trip.
#[derive(Debug, Serialize, Deserialize)]
struct TierTwoRecord {
    value: Value,
    stored_at_ms: i64,
    ttl_ms: u64,
    #[serde(default)]
    tags: Vec<String>,
}

impl TierTwoRecord {
    fn age_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.stored_at_ms
    }

    fn expired(&self) -> bool {
        self.age_ms() > self.ttl_ms as i64
    }

    fn remaining_ttl(&self) -> Duration {
        let remaining = self.ttl_ms as i64 - self.age_ms();
        Duration::from_millis(remaining.max(0) as u64)
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub entries: usize,
    pub estimated_bytes: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct TierOne {
    entries: HashMap<String, TierOneEntry>,
    bytes: usize,
}

impl TierOne {
    fn remove(&mut self, key: &str) -> Option<TierOneEntry> {
        let entry = self.entries.remove(key)?;
        self.bytes -= entry.size;
        Some(entry)
    }
}

/// Two-tier cache: a fast in-process map in front of the slower persistent
/// storage collaborator. Reads promote tier-two records into tier-one;
/// writes land in both tiers. Storage failures are logged and degrade to
/// misses, never surfaced to callers.
pub struct CacheLayer {
    tier_one: RwLock<TierOne>,
    storage: Arc<dyn Storage>,
    max_total_bytes: usize,
    max_entry_bytes: usize,
    default_ttl: Duration,
    sweep_interval: Duration,
    counters: CacheCounters,
}

impl CacheLayer {
    pub fn new(config: &CacheConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            tier_one: RwLock::new(TierOne::default()),
            storage,
            max_total_bytes: config.max_total_bytes,
            max_entry_bytes: config.max_entry_bytes,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            counters: CacheCounters::default(),
        }
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", STORAGE_PREFIX, key)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        {
            let mut tier_one = self.tier_one.write().await;
            if let Some(entry) = tier_one.entries.get(key) {
                if !entry.expired() {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                tier_one.remove(key);
            }
        }

        let storage_key = Self::storage_key(key);
        let raw = match self.storage.get(&storage_key).await {
            Ok(raw) => raw,
            Err(err) => {
                log::debug!("cache tier-two miss for '{}': {}", key, err);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let record: TierTwoRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("malformed cache record for '{}': {}", key, err);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if record.expired() {
            if let Err(err) = self.storage.delete(&storage_key).await {
                log::warn!("failed to purge expired cache record '{}': {}", key, err);
            }
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Promote into tier-one with whatever TTL the record has left.
        let tags: HashSet<String> = record.tags.iter().cloned().collect();
        let size = estimate_size(&record.value);
        self.insert_tier_one(key, record.value.clone(), record.remaining_ttl(), tags, size)
            .await;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(record.value)
    }

    pub async fn set(&self, key: &str, value: Value, options: CacheOptions) {
        let size = estimate_size(&value);
        if size > self.max_entry_bytes {
            log::warn!(
                "cache entry '{}' of {} bytes exceeds the {} byte entry limit, skipping",
                key,
                size,
                self.max_entry_bytes
            );
            return;
        }

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        let tags: HashSet<String> = options.tags.iter().cloned().collect();
        self.insert_tier_one(key, value.clone(), ttl, tags, size).await;

        let record = TierTwoRecord {
            value,
            stored_at_ms: chrono::Utc::now().timestamp_millis(),
            ttl_ms: ttl.as_millis() as u64,
            tags: options.tags,
        };
        match serde_json::to_value(&record) {
            Ok(raw) => {
                if let Err(err) = self.storage.save(&Self::storage_key(key), raw).await {
                    log::warn!("failed to persist cache entry '{}': {}", key, err);
                }
            }
            Err(err) => log::warn!("failed to serialize cache entry '{}': {}", key, err),
        }

        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert into tier-one, evicting oldest-by-insertion entries until the
    /// byte cap holds. Tier-two keeps its records; the promotion path brings
    /// evicted values back on the next read.
    async fn insert_tier_one(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
        tags: HashSet<String>,
        size: usize,
    ) {
        let mut tier_one = self.tier_one.write().await;
        tier_one.remove(key);

        if tier_one.bytes + size > self.max_total_bytes {
            let by_age: Vec<String> = tier_one
                .entries
                .iter()
                .sorted_by_key(|(_, entry)| entry.created)
                .map(|(key, _)| key.clone())
                .collect();
            for victim in by_age {
                if tier_one.bytes + size <= self.max_total_bytes {
                    break;
                }
                tier_one.remove(&victim);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                log::debug!("evicted cache entry '{}'", victim);
            }
        }

        tier_one.bytes += size;
        tier_one.entries.insert(
            key.to_string(),
            TierOneEntry {
                value,
                created: Instant::now(),
                ttl,
                tags,
                size,
            },
        );
    }

    pub async fn delete(&self, key: &str) {
        self.tier_one.write().await.remove(key);
        if let Err(err) = self.storage.delete(&Self::storage_key(key)).await {
            log::warn!("failed to delete cache entry '{}': {}", key, err);
        }
    }

    pub async fn clear(&self) {
        {
            let mut tier_one = self.tier_one.write().await;
            tier_one.entries.clear();
            tier_one.bytes = 0;
        }
        match self.storage.list(STORAGE_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    if let Err(err) = self.storage.delete(&key).await {
                        log::warn!("failed to clear cache record '{}': {}", key, err);
                    }
                }
            }
            Err(err) => log::warn!("failed to list cache records for clear: {}", err),
        }
    }

    /// Remove every entry, across both tiers, whose tag set contains `tag`.
    pub async fn invalidate_tag(&self, tag: &str) {
        {
            let mut tier_one = self.tier_one.write().await;
            let tagged: Vec<String> = tier_one
                .entries
                .iter()
                .filter(|(_, entry)| entry.tags.contains(tag))
                .map(|(key, _)| key.clone())
                .collect();
            for key in tagged {
                tier_one.remove(&key);
            }
        }

        let keys = match self.storage.list(STORAGE_PREFIX).await {
            Ok(keys) => keys,
            Err(err) => {
                log::warn!("failed to list cache records for tag '{}': {}", tag, err);
                return;
            }
        };
        for key in keys {
            let Ok(raw) = self.storage.get(&key).await else {
                continue;
            };
            let Ok(record) = serde_json::from_value::<TierTwoRecord>(raw) else {
                continue;
            };
            if record.tags.iter().any(|t| t == tag) {
                if let Err(err) = self.storage.delete(&key).await {
                    log::warn!("failed to invalidate cache record '{}': {}", key, err);
                }
            }
        }
    }

    /// Drop expired tier-one entries; returns how many were removed. The
    /// sweeper task calls this on a fixed interval so dead entries do not
    /// linger until the next read.
    pub async fn purge_expired(&self) -> usize {
        let mut tier_one = self.tier_one.write().await;
        let expired: Vec<String> = tier_one
            .entries
            .iter()
            .filter(|(_, entry)| entry.expired())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            tier_one.remove(key);
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.sweep_interval);
            // the first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.purge_expired().await;
                if removed > 0 {
                    log::debug!("cache sweep removed {} expired entries", removed);
                }
            }
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let tier_one = self.tier_one.read().await;
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: tier_one.entries.len(),
            estimated_bytes: tier_one.bytes,
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64
            },
        }
    }

    /// Short-circuit an async computation through the cache, keyed on the
    /// function name and a digest of its serialized arguments.
    pub async fn memoize<F, Fut>(
        &self,
        name: &str,
        args: &Value,
        ttl: Option<Duration>,
        compute: F,
    ) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let key = memo_key(name, args);
        if let Some(hit) = self.get(&key).await {
            return Ok(hit);
        }
        let value = compute().await?;
        self.set(
            &key,
            value.clone(),
            CacheOptions {
                ttl,
                tags: Vec::new(),
            },
        )
        .await;
        Ok(value)
    }
}

fn estimate_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

fn memo_key(name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(args.to_string().as_bytes());
    format!("memo:{}:{}", name, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    fn test_config(max_total: usize, max_entry: usize) -> CacheConfig {
        CacheConfig {
            max_total_bytes: max_total,
            max_entry_bytes: max_entry,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }

    fn cache_over(storage: Arc<dyn Storage>) -> CacheLayer {
        CacheLayer::new(&test_config(1024 * 1024, 64 * 1024), storage)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let cache = cache_over(Arc::new(MemoryStorage::new()));

        cache.set("k", json!("v"), CacheOptions::default()).await;
        assert_eq!(cache.get("k").await, Some(json!("v")));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.sets, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let cache = cache_over(Arc::new(MemoryStorage::new()));

        cache
            .set("k", json!("v"), CacheOptions::ttl(Duration::from_millis(30)))
            .await;
        assert_eq!(cache.get("k").await, Some(json!("v")));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await, None);
        // the expired record was purged from tier-two as well
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_on_next_read() {
        let cache = cache_over(Arc::new(MemoryStorage::new()));
        cache
            .set("k", json!(1), CacheOptions::ttl(Duration::ZERO))
            .await;
        sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_first_and_respects_cap() {
        let storage = Arc::new(MemoryStorage::new());
        // each payload below serializes to 30 bytes; a 70 byte cap holds two
        let cache = CacheLayer::new(&test_config(70, 64), storage);

        cache
            .set("a", json!({"payload": "aaaaaaaaaaaaaaaa"}), CacheOptions::default())
            .await;
        sleep(Duration::from_millis(5)).await;
        cache
            .set("b", json!({"payload": "bbbbbbbbbbbbbbbb"}), CacheOptions::default())
            .await;
        sleep(Duration::from_millis(5)).await;
        cache
            .set("c", json!({"payload": "cccccccccccccccc"}), CacheOptions::default())
            .await;

        let stats = cache.stats().await;
        assert!(stats.evictions >= 1);
        assert!(stats.estimated_bytes <= 70);

        // "a" was the oldest insertion, so it left tier-one first; the newest
        // entry always survives
        let tier_one = cache.tier_one.read().await;
        assert!(!tier_one.entries.contains_key("a"));
        assert!(tier_one.entries.contains_key("c"));
    }

    #[tokio::test]
    async fn test_evicted_entry_comes_back_from_tier_two() {
        let storage = Arc::new(MemoryStorage::new());
        let cache = CacheLayer::new(&test_config(70, 64), storage);

        cache
            .set("a", json!({"payload": "aaaaaaaaaaaaaaaa"}), CacheOptions::default())
            .await;
        cache
            .set("b", json!({"payload": "bbbbbbbbbbbbbbbb"}), CacheOptions::default())
            .await;
        cache
            .set("c", json!({"payload": "cccccccccccccccc"}), CacheOptions::default())
            .await;

        // whichever entries were evicted are still promotable from tier-two
        assert_eq!(
            cache.get("a").await,
            Some(json!({"payload": "aaaaaaaaaaaaaaaa"}))
        );
    }

    #[tokio::test]
    async fn test_oversized_entry_is_rejected_not_stored() {
        let cache = CacheLayer::new(&test_config(1024, 16), Arc::new(MemoryStorage::new()));

        cache
            .set("big", json!({"payload": "xxxxxxxxxxxxxxxxxxxxxxxxxxxxx"}), CacheOptions::default())
            .await;

        assert_eq!(cache.get("big").await, None);
        assert_eq!(cache.stats().await.sets, 0);
    }

    #[tokio::test]
    async fn test_promotion_from_tier_two() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let writer = cache_over(storage.clone());
        writer.set("shared", json!(42), CacheOptions::default()).await;

        // a fresh cache instance has an empty tier-one but shares storage
        let reader = cache_over(storage);
        assert_eq!(reader.get("shared").await, Some(json!(42)));
        assert_eq!(reader.stats().await.entries, 1);
        assert_eq!(reader.stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_tag_clears_both_tiers() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cache = cache_over(storage.clone());

        cache
            .set("p:1", json!(1), CacheOptions::tagged(vec!["posts".into()]))
            .await;
        cache
            .set("p:2", json!(2), CacheOptions::tagged(vec!["posts".into()]))
            .await;
        cache
            .set("u:1", json!(3), CacheOptions::tagged(vec!["users".into()]))
            .await;

        cache.invalidate_tag("posts").await;

        assert_eq!(cache.get("p:1").await, None);
        assert_eq!(cache.get("p:2").await, None);
        assert_eq!(cache.get("u:1").await, Some(json!(3)));
        assert!(storage.get("cache:p:1").await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired_sweeps_dead_entries() {
        let cache = cache_over(Arc::new(MemoryStorage::new()));

        cache
            .set("dead", json!(1), CacheOptions::ttl(Duration::from_millis(10)))
            .await;
        cache.set("alive", json!(2), CacheOptions::default()).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_memoize_computes_once_per_distinct_args() {
        let cache = cache_over(Arc::new(MemoryStorage::new()));
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = cache
                .memoize("square", &json!([7]), None, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(49))
                })
                .await
                .unwrap();
            assert_eq!(result, json!(49));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls2 = calls.clone();
        cache
            .memoize("square", &json!([8]), None, move || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(json!(64))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let cache = cache_over(storage.clone());

        cache.set("a", json!(1), CacheOptions::default()).await;
        cache.set("b", json!(2), CacheOptions::default()).await;

        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);

        cache.clear().await;
        assert_eq!(cache.get("b").await, None);
        assert!(storage.list("cache:").await.unwrap().is_empty());
    }
}
