//! In-memory durable store.
//!
//! Behaves like [`super::LmdbDurableStore`] without touching disk. Used by
//! tests and by deployments that only want the L1 semantics with a shared
//! process-local L2.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fundcache_core::CacheResult;

use super::traits::DurableStore;

/// Durable store backed by an ordered map.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    entries: tokio::sync::RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn clear(&self) -> CacheResult<u64> {
        let mut entries = self.entries.write().await;
        let count = entries.len() as u64;
        entries.clear();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let store = InMemoryDurableStore::new();
        assert!(store.is_empty().await);

        store.write("a", b"1").await.unwrap();
        store.write("b", b"2").await.unwrap();
        assert_eq!(store.read("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.len().await, 2);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.read("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_scan_is_ordered() {
        let store = InMemoryDurableStore::new();
        for key in ["fund:z:1:v1", "fund:a:1:v1", "funds:x:1:v1", "user:a:1:v1"] {
            store.write(key, b"x").await.unwrap();
        }

        let keys = store.keys_with_prefix("fund:").await.unwrap();
        assert_eq!(keys, vec!["fund:a:1:v1", "fund:z:1:v1"]);
    }

    #[tokio::test]
    async fn test_clear_returns_count() {
        let store = InMemoryDurableStore::new();
        store.write("a", b"1").await.unwrap();
        store.write("b", b"2").await.unwrap();
        assert_eq!(store.clear().await.unwrap(), 2);
        assert!(store.keys().await.unwrap().is_empty());
    }
}
