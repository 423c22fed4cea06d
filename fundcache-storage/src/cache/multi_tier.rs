//! Two-tier cache: bounded L1 in memory over a durable L2 store.
//!
//! # Write discipline
//!
//! Writes go to L2 first and then to L1, under the lock stripe of their key.
//! An L1 miss that promotes from L2 takes the same stripe, so a promotion can
//! never resurrect a value that a concurrent `remove` already deleted from
//! L2. Operations on keys in different stripes never wait on each other, and
//! L1 hits take no stripe at all.
//!
//! # Errors
//!
//! `get` degrades storage faults to a miss (logged at `warn`). `get_entry`,
//! `put` and `remove` propagate them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fundcache_core::{CacheConfig, CacheEntry, CacheResult, KeyError};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::l1::{L1Lookup, L1Tier};
use super::traits::{CacheStats, DurableStore, ValueLoader};

/// Number of writer lock stripes.
const LOCK_STRIPES: usize = 64;

/// Striped writer locks keyed by cache key.
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_of(key)].lock().await
    }

    /// Every stripe, taken in index order.
    async fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        let mut guards = Vec::with_capacity(self.stripes.len());
        for stripe in &self.stripes {
            guards.push(stripe.lock().await);
        }
        guards
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    promotions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Result of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub l1_removed: u64,
    pub l2_removed: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.l1_removed + self.l2_removed
    }
}

/// The runtime cache.
///
/// One instance is constructed at startup and shared by handle (`Arc`).
pub struct MultiTierCache<S: DurableStore> {
    l1: L1Tier,
    store: Arc<S>,
    config: CacheConfig,
    counters: CacheCounters,
    locks: KeyLocks,
}

impl<S: DurableStore> MultiTierCache<S> {
    /// Build a cache over `store`. Fails if `config` does not validate.
    pub fn new(store: Arc<S>, config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            l1: L1Tier::new(config.l1_capacity, config.eviction_policy),
            store,
            config,
            counters: CacheCounters::default(),
            locks: KeyLocks::new(LOCK_STRIPES),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The durable tier.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn l2_enabled(&self) -> bool {
        self.config.l2_enabled
    }

    fn record_hit(&self, l1: bool) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        if l1 {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evictions(&self, evicted: &[String]) {
        if evicted.is_empty() {
            return;
        }
        self.counters
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for key in evicted {
            debug!(key = %key, "evicted from L1");
        }
    }

    /// Read `key`. Storage faults and undecodable entries read as a miss.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.get_entry(key).await {
            Ok(entry) => entry.map(|e| e.value),
            Err(e) => {
                warn!(key = %key, error = %e, "cache read degraded to miss");
                None
            }
        }
    }

    /// Read the full entry for `key`, propagating storage faults.
    ///
    /// Expired entries read as `None` and stay in place until the next sweep.
    pub async fn get_entry(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        match self.l1.lookup(key, now)? {
            L1Lookup::Hit(entry) => {
                self.record_hit(true);
                return Ok(Some(entry));
            }
            L1Lookup::Expired => {
                self.record_miss();
                return Ok(None);
            }
            L1Lookup::Miss => {}
        }

        if !self.l2_enabled() {
            self.record_miss();
            return Ok(None);
        }

        let _guard = self.locks.lock(key).await;

        // A writer may have filled L1 while we waited.
        match self.l1.lookup(key, now)? {
            L1Lookup::Hit(entry) => {
                self.record_hit(true);
                return Ok(Some(entry));
            }
            L1Lookup::Expired => {
                self.record_miss();
                return Ok(None);
            }
            L1Lookup::Miss => {}
        }

        let Some(bytes) = self.store.read(key).await? else {
            self.record_miss();
            return Ok(None);
        };
        let entry = CacheEntry::decode(&bytes)?;
        if entry.is_expired_at(now) {
            self.record_miss();
            return Ok(None);
        }

        let evicted = self.l1.insert(key, entry.clone())?;
        self.record_evictions(&evicted);
        self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        self.record_hit(false);
        debug!(key = %key, "promoted entry from L2");

        Ok(Some(entry))
    }

    /// Whether `key` holds an unexpired entry.
    pub async fn contains(&self, key: &str) -> CacheResult<bool> {
        Ok(self.get_entry(key).await?.is_some())
    }

    /// Write `value` under `key` through both tiers.
    ///
    /// `ttl` falls back to the configured default. Replaces any existing
    /// entry, resetting its creation and expiry times.
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> CacheResult<()> {
        let entry = CacheEntry::new(value, ttl.or(self.config.default_ttl));
        self.put_entry(key, entry).await
    }

    /// Write a prebuilt entry, keeping its timestamps.
    pub async fn put_entry(&self, key: &str, entry: CacheEntry) -> CacheResult<()> {
        check_key(key)?;

        let _guard = self.locks.lock(key).await;
        if self.l2_enabled() {
            self.store.write(key, &entry.encode()).await?;
        }
        let evicted = self.l1.insert(key, entry)?;
        self.record_evictions(&evicted);
        Ok(())
    }

    /// Delete `key` from both tiers. Returns whether anything was removed.
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let _guard = self.locks.lock(key).await;
        let in_l2 = if self.l2_enabled() {
            self.store.delete(key).await?
        } else {
            false
        };
        let in_l1 = self.l1.remove(key)?;
        Ok(in_l1 || in_l2)
    }

    /// Empty both tiers.
    pub async fn clear(&self) -> CacheResult<()> {
        let _guards = self.locks.lock_all().await;
        if self.l2_enabled() {
            self.store.clear().await?;
        }
        let dropped = self.l1.clear()?;
        debug!(l1_entries = dropped, "cache cleared");
        Ok(())
    }

    /// Remove expired entries from both tiers.
    ///
    /// L2 is scanned without holding any stripe; each candidate is re-read
    /// under its own stripe before deletion so a concurrent `put` is never
    /// lost.
    pub async fn cleanup(&self) -> CacheResult<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport {
            l1_removed: self.l1.purge_expired(now)?.len() as u64,
            l2_removed: 0,
        };

        if self.l2_enabled() {
            for key in self.store.keys().await? {
                let _guard = self.locks.lock(&key).await;
                let Some(bytes) = self.store.read(&key).await? else {
                    continue;
                };
                match CacheEntry::decode(&bytes) {
                    Ok(entry) if entry.is_expired_at(now) => {
                        if self.store.delete(&key).await? {
                            report.l2_removed += 1;
                        }
                        self.l1.remove(&key)?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(key = %key, error = %e, "skipping undecodable L2 entry");
                    }
                }
            }
        }

        self.counters
            .expirations
            .fetch_add(report.total(), Ordering::Relaxed);
        debug!(
            l1_removed = report.l1_removed,
            l2_removed = report.l2_removed,
            "cleanup sweep finished"
        );
        Ok(report)
    }

    /// Read and decode a JSON payload.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode `value` as JSON and write it through both tiers.
    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let entry = CacheEntry::from_json(value, ttl.or(self.config.default_ttl))?;
        self.put_entry(key, entry).await
    }

    /// Read `key`, or load it through `loader` on a miss and cache the result.
    pub async fn get_or_load<L: ValueLoader + ?Sized>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: &L,
    ) -> CacheResult<Option<Vec<u8>>> {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        match loader.load(key).await? {
            Some(value) => {
                self.put(key, value.clone(), ttl).await?;
                debug!(key = %key, "loaded value on miss");
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Every key held by either tier, sorted. May include expired entries
    /// not yet swept.
    pub async fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys = self.l1.keys()?;
        if self.l2_enabled() {
            keys.extend(self.store.keys().await?);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.counters.l2_hits.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            l1_entries: self.l1.len()? as u64,
            l1_size_bytes: self.l1.size_bytes()?,
        })
    }
}

fn check_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(KeyError::InvalidArgument {
            field: "key".to_string(),
            reason: "must not be empty".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDurableStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use fundcache_core::EvictionPolicy;
    use std::sync::atomic::AtomicUsize;

    fn cache_with(config: CacheConfig) -> MultiTierCache<InMemoryDurableStore> {
        MultiTierCache::new(Arc::new(InMemoryDurableStore::new()), config).unwrap()
    }

    fn small_cache(capacity: usize) -> MultiTierCache<InMemoryDurableStore> {
        cache_with(CacheConfig::new().with_l1_capacity(capacity))
    }

    #[tokio::test]
    async fn test_put_get_writes_through() {
        let cache = small_cache(10);
        cache.put("fund:detail:000001:v1", b"nav".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("fund:detail:000001:v1").await, Some(b"nav".to_vec()));
        let raw = cache.store().read("fund:detail:000001:v1").await.unwrap();
        assert!(raw.is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry_reads_as_miss() {
        let cache = small_cache(10);
        cache
            .put("k", b"v".to_vec(), Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_capacity_plus_one_evicts_lru_and_get_protects() {
        let cache = small_cache(3);
        for key in ["a", "b", "c"] {
            cache.put(key, key.as_bytes().to_vec(), None).await.unwrap();
        }
        // Refresh "a" so "b" becomes least recently used.
        assert!(cache.get("a").await.is_some());
        cache.put("d", b"d".to_vec(), None).await.unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.l1_entries, 3);

        // "b" left L1 but is still durable, so it promotes back.
        assert_eq!(cache.get("b").await, Some(b"b".to_vec()));
        let stats = cache.stats().unwrap();
        assert_eq!(stats.promotions, 1);
        assert_eq!(stats.l2_hits, 1);
    }

    #[tokio::test]
    async fn test_l1_only_mode_loses_evicted_entries() {
        let cache = cache_with(CacheConfig::new().with_l1_capacity(1).with_l2(false));
        cache.put("a", b"1".to_vec(), None).await.unwrap();
        cache.put("b", b"2".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some(b"2".to_vec()));
        assert!(cache.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_fifo_policy() {
        let cache = cache_with(
            CacheConfig::new()
                .with_l1_capacity(2)
                .with_l2(false)
                .with_eviction_policy(EvictionPolicy::Fifo),
        );
        cache.put("a", b"1".to_vec(), None).await.unwrap();
        cache.put("b", b"2".to_vec(), None).await.unwrap();
        assert!(cache.get("a").await.is_some());
        cache.put("c", b"3".to_vec(), None).await.unwrap();

        assert_eq!(cache.get("a").await, None);
        assert!(cache.get("b").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = small_cache(10);
        cache.put("a", b"1".to_vec(), None).await.unwrap();
        cache.put("b", b"2".to_vec(), None).await.unwrap();

        assert!(cache.remove("a").await.unwrap());
        assert!(!cache.remove("a").await.unwrap());
        assert_eq!(cache.get("a").await, None);

        cache.clear().await.unwrap();
        assert_eq!(cache.get("b").await, None);
        assert!(cache.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_rejects_empty_key() {
        let cache = small_cache(10);
        assert!(cache.put("", b"v".to_vec(), None).await.is_err());
    }

    #[tokio::test]
    async fn test_overwrite_resets_expiry() {
        let cache = small_cache(10);
        cache
            .put("k", b"old".to_vec(), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        cache.put("k", b"new".to_vec(), None).await.unwrap();

        let entry = cache.get_entry("k").await.unwrap().unwrap();
        assert_eq!(entry.value, b"new");
        assert!(entry.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_put_entry_preserves_timestamps() {
        let cache = small_cache(10);
        let now = Utc::now();
        let entry = CacheEntry::with_times(
            b"v".to_vec(),
            now - ChronoDuration::hours(1),
            Some(now + ChronoDuration::hours(1)),
        );
        cache.put_entry("k", entry.clone()).await.unwrap();

        // Evict from L1 by clearing it directly, then read back from L2.
        cache.l1.clear().unwrap();
        let back = cache.get_entry("k").await.unwrap().unwrap();
        assert_eq!(
            back.created_at.timestamp_millis(),
            entry.created_at.timestamp_millis()
        );
        assert_eq!(
            back.expires_at.map(|t| t.timestamp_millis()),
            entry.expires_at.map(|t| t.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_both_tiers() {
        let cache = small_cache(10);
        let now = Utc::now();
        let expired = CacheEntry::with_times(
            b"old".to_vec(),
            now - ChronoDuration::seconds(10),
            Some(now - ChronoDuration::seconds(1)),
        );
        cache.put_entry("expired", expired).await.unwrap();
        cache.put("live", b"v".to_vec(), None).await.unwrap();

        let report = cache.cleanup().await.unwrap();
        assert_eq!(report, CleanupReport { l1_removed: 1, l2_removed: 1 });
        assert_eq!(cache.keys().await.unwrap(), vec!["live"]);
        assert_eq!(cache.stats().unwrap().expirations, 2);
    }

    #[tokio::test]
    async fn test_json_accessors() {
        let cache = small_cache(10);
        let favorites = vec!["000001".to_string(), "000002".to_string()];
        cache
            .put_json("user:favorites:default:v1", &favorites, None)
            .await
            .unwrap();

        let back: Option<Vec<String>> = cache.get_json("user:favorites:default:v1").await.unwrap();
        assert_eq!(back, Some(favorites));

        let missing: Option<Vec<String>> = cache.get_json("nope").await.unwrap();
        assert!(missing.is_none());
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ValueLoader for CountingLoader {
        async fn load(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key == "absent" {
                return Ok(None);
            }
            Ok(Some(format!("loaded:{}", key).into_bytes()))
        }
    }

    #[tokio::test]
    async fn test_get_or_load_caches_loaded_value() {
        let cache = small_cache(10);
        let loader = CountingLoader {
            calls: AtomicUsize::new(0),
        };

        let first = cache.get_or_load("k", None, &loader).await.unwrap();
        let second = cache.get_or_load("k", None, &loader).await.unwrap();
        assert_eq!(first, Some(b"loaded:k".to_vec()));
        assert_eq!(first, second);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_or_load("absent", None, &loader).await.unwrap(), None);
        assert_eq!(cache.get("absent").await, None);
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let cache = small_cache(10);
        cache.put("k", b"v".to_vec(), None).await.unwrap();
        let _ = cache.get("k").await;
        let _ = cache.get("missing").await;

        let stats = cache.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.l1_hits, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_concurrent_puts_and_gets() {
        let cache = Arc::new(small_cache(8));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let key = format!("w{}:{}", worker, i);
                    cache.put(&key, vec![worker as u8], None).await.unwrap();
                    assert_eq!(cache.get(&key).await, Some(vec![worker as u8]));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.keys().await.unwrap().len(), 200);
        assert!(cache.stats().unwrap().l1_entries <= 8);
    }

    /// Store whose writes under `slow:` stall for `delay`.
    struct SlowWriteStore {
        inner: InMemoryDurableStore,
        delay: Duration,
    }

    #[async_trait]
    impl DurableStore for SlowWriteStore {
        async fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
            if key.starts_with("slow:") {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.write(key, value).await
        }

        async fn delete(&self, key: &str) -> CacheResult<bool> {
            self.inner.delete(key).await
        }

        async fn keys(&self) -> CacheResult<Vec<String>> {
            self.inner.keys().await
        }

        async fn clear(&self) -> CacheResult<u64> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn test_slow_write_does_not_block_promotion_of_other_key() {
        let store = Arc::new(SlowWriteStore {
            inner: InMemoryDurableStore::new(),
            delay: Duration::from_millis(800),
        });
        let cache = Arc::new(MultiTierCache::new(Arc::clone(&store), CacheConfig::new()).unwrap());

        let slow_key = "slow:a";
        let fast_key = (0..)
            .map(|i| format!("fast:{}", i))
            .find(|k| cache.locks.stripe_of(k) != cache.locks.stripe_of(slow_key))
            .unwrap();
        // only in L2, so the read has to promote
        store
            .inner
            .write(&fast_key, &CacheEntry::new(b"v".to_vec(), None).encode())
            .await
            .unwrap();

        let writer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.put(slow_key, b"x".to_vec(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let read = tokio::time::timeout(Duration::from_millis(300), cache.get(&fast_key)).await;
        assert_eq!(read.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.stats().unwrap().promotions, 1);

        writer.await.unwrap().unwrap();
        assert_eq!(cache.get(slow_key).await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_waits_for_in_flight_writer() {
        let store = Arc::new(SlowWriteStore {
            inner: InMemoryDurableStore::new(),
            delay: Duration::from_millis(100),
        });
        let cache = Arc::new(MultiTierCache::new(Arc::clone(&store), CacheConfig::new()).unwrap());

        let writer = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.put("slow:b", b"x".to_vec(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.clear().await.unwrap();
        writer.await.unwrap().unwrap();

        assert!(store.inner.is_empty().await);
        assert_eq!(cache.get("slow:b").await, None);
    }
}
