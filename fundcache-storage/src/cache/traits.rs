//! Durable store and loader traits, plus cache statistics.
//!
//! The durable store is the L2 tier: the system of record behind the
//! in-memory L1 tier. Anything that can read, write and delete byte values by
//! string key can back it.

use async_trait::async_trait;
use fundcache_core::CacheResult;

/// Durable key/value store used as the L2 tier.
///
/// Implementations must be thread-safe. Values are opaque bytes; the cache
/// stores [`fundcache_core::CacheEntry::encode`] output in them.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read the raw bytes stored under `key`.
    async fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Write `value` under `key`, replacing any previous value.
    async fn write(&self, key: &str, value: &[u8]) -> CacheResult<()>;

    /// Delete `key`. Returns whether a value was present.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// All stored keys, in the store's natural order.
    async fn keys(&self) -> CacheResult<Vec<String>>;

    /// Remove every key. Returns the number removed.
    async fn clear(&self) -> CacheResult<u64>;

    /// Keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

/// Loader consulted by [`super::MultiTierCache::get_or_load`] on a miss.
///
/// This is the seam to the remote data-fetch layer, which stays opaque to
/// the cache.
#[async_trait]
pub trait ValueLoader: Send + Sync {
    /// Produce the value for `key`, or `None` if it does not exist upstream.
    async fn load(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered by either tier.
    pub hits: u64,
    /// Reads answered by neither tier.
    pub misses: u64,
    /// Reads answered by L1.
    pub l1_hits: u64,
    /// Reads answered by L2 (and promoted).
    pub l2_hits: u64,
    /// Entries copied from L2 into L1.
    pub promotions: u64,
    /// Entries evicted from L1 due to capacity.
    pub evictions: u64,
    /// Expired entries removed by cleanup sweeps, counted per tier.
    pub expirations: u64,
    /// Entries currently in L1.
    pub l1_entries: u64,
    /// Approximate L1 payload size in bytes.
    pub l1_size_bytes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
