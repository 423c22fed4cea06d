//! LMDB-backed durable store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped,
//! crash-safe key-value store for the L2 tier.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `read` and `keys`
//! - Write transactions for `write`, `delete` and `clear`
//! - Byte/operation counters are atomics

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fundcache_core::{CacheResult, StorageError};
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};

use super::traits::DurableStore;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStoreError to CacheError.
impl From<LmdbStoreError> for fundcache_core::CacheError {
    fn from(e: LmdbStoreError) -> Self {
        fundcache_core::CacheError::Storage(StorageError::Backend {
            reason: e.to_string(),
        })
    }
}

/// Counters for LMDB store activity.
#[derive(Debug, Default)]
struct LmdbCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
}

/// Point-in-time view of LMDB store activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LmdbStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub bytes_written: u64,
    pub entry_count: u64,
}

/// LMDB-backed durable store.
///
/// # Example
///
/// ```ignore
/// use fundcache_storage::cache::LmdbDurableStore;
///
/// let store = LmdbDurableStore::new("/var/lib/fundcache", 256)?;
/// store.write("fund:detail:000001:v1", b"...").await?;
/// let bytes = store.read("fund:detail:000001:v1").await?;
/// ```
pub struct LmdbDurableStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Str, Bytes>,
    counters: LmdbCounters,
}

impl LmdbDurableStore {
    /// Open (or create) an LMDB store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: each store owns its directory and the environment is opened
        // once per path within the process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Str, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            counters: LmdbCounters::default(),
        })
    }

    /// Activity counters plus the current entry count.
    pub fn stats(&self) -> CacheResult<LmdbStoreStats> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let entry_count = self
            .db
            .len(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(LmdbStoreStats {
            reads: self.counters.reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            entry_count,
        })
    }
}

#[async_trait]
impl DurableStore for LmdbDurableStore {
    async fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(|e| StorageError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let value = self.db.get(&rtxn, key).map_err(|e| StorageError::Read {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        Ok(value.map(|bytes| bytes.to_vec()))
    }

    async fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        let write_err = |e: heed::Error| StorageError::Write {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let mut wtxn = self.env.write_txn().map_err(write_err)?;
        self.db.put(&mut wtxn, key, value).map_err(write_err)?;
        wtxn.commit().map_err(write_err)?;

        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(value.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let delete_err = |e: heed::Error| StorageError::Delete {
            key: key.to_string(),
            reason: e.to_string(),
        };

        let mut wtxn = self.env.write_txn().map_err(delete_err)?;
        let deleted = self.db.delete(&mut wtxn, key).map_err(delete_err)?;
        wtxn.commit().map_err(delete_err)?;

        if deleted {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(deleted)
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            match result {
                Ok((key, _)) => keys.push(key.to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable LMDB entry");
                }
            }
        }
        Ok(keys)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .prefix_iter(&rtxn, prefix)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for (key, _) in iter.flatten() {
            keys.push(key.to_string());
        }
        Ok(keys)
    }

    async fn clear(&self) -> CacheResult<u64> {
        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let count = self
            .db
            .len(&wtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        self.db
            .clear(&mut wtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        self.counters.deletes.fetch_add(count, Ordering::Relaxed);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbDurableStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbDurableStore::new(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (store, _temp_dir) = create_test_store();

        store
            .write("fund:detail:000001:v1", b"hello")
            .await
            .expect("write should succeed");

        let value = store
            .read("fund:detail:000001:v1")
            .await
            .expect("read should succeed");
        assert_eq!(value.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let (store, _temp_dir) = create_test_store();
        let value = store.read("missing").await.expect("read should succeed");
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp_dir) = create_test_store();

        store.write("k", b"v").await.expect("write should succeed");
        assert!(store.delete("k").await.expect("delete should succeed"));
        assert!(!store.delete("k").await.expect("delete should succeed"));
        assert!(store.read("k").await.expect("read should succeed").is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (store, _temp_dir) = create_test_store();

        store.write("k", b"first").await.expect("write should succeed");
        store.write("k", b"second").await.expect("write should succeed");

        let value = store.read("k").await.expect("read should succeed");
        assert_eq!(value.as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn test_keys_and_prefix() {
        let (store, _temp_dir) = create_test_store();

        for key in ["fund:a:1:v1", "fund:b:2:v1", "user:favorites:default:v1"] {
            store.write(key, b"x").await.expect("write should succeed");
        }

        let keys = store.keys().await.expect("keys should succeed");
        assert_eq!(keys.len(), 3);

        let fund_keys = store
            .keys_with_prefix("fund:")
            .await
            .expect("prefix scan should succeed");
        assert_eq!(fund_keys, vec!["fund:a:1:v1", "fund:b:2:v1"]);
    }

    #[tokio::test]
    async fn test_clear_and_stats() {
        let (store, _temp_dir) = create_test_store();

        for i in 0..4 {
            store
                .write(&format!("k{}", i), b"value")
                .await
                .expect("write should succeed");
        }
        let _ = store.read("k0").await;

        let stats = store.stats().expect("stats should succeed");
        assert_eq!(stats.writes, 4);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_written, 20);
        assert_eq!(stats.entry_count, 4);

        let cleared = store.clear().await.expect("clear should succeed");
        assert_eq!(cleared, 4);
        assert!(store.keys().await.expect("keys should succeed").is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbDurableStore::new(temp_dir.path(), 10).expect("open should succeed");
            store.write("k", b"durable").await.expect("write should succeed");
        }
        let store = LmdbDurableStore::new(temp_dir.path(), 10).expect("reopen should succeed");
        let value = store.read("k").await.expect("read should succeed");
        assert_eq!(value.as_deref(), Some(&b"durable"[..]));
    }
}
