//! fundcache Test Utilities
//!
//! Shared test infrastructure for the fundcache workspace:
//! - Proptest generators for canonical and legacy keys
//! - Fixtures for caches seeded with legacy data
//! - A fault-injecting durable store for failure-path tests

pub use fundcache_core::{
    CacheConfig, CacheEntry, CacheError, CacheKey, CacheResult, KeyCodec, StorageError,
    KNOWN_MODULES,
};
pub use fundcache_storage::{DurableStore, InMemoryDurableStore, MultiTierCache};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

// ============================================================================
// GENERATORS
// ============================================================================

/// One of the recognised modules.
pub fn arb_module() -> impl Strategy<Value = String> {
    proptest::sample::select(KNOWN_MODULES.to_vec()).prop_map(str::to_string)
}

/// A lowercase type token.
pub fn arb_key_type() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}"
}

/// A valid identifier.
pub fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9_-]{0,30}[a-z0-9]"
}

pub fn arb_version() -> impl Strategy<Value = String> {
    (1u32..100).prop_map(|n| format!("v{}", n))
}

/// A canonical `module:type:identifier:version` string.
pub fn arb_canonical_key() -> impl Strategy<Value = String> {
    (arb_module(), arb_key_type(), arb_identifier(), arb_version())
        .prop_map(|(m, t, i, v)| format!("{}:{}:{}:{}", m, t, i, v))
}

/// A legacy, non-canonical key such as `fund_detail_000001`.
pub fn arb_legacy_key() -> impl Strategy<Value = String> {
    "[a-z]{3,8}_[a-z]{3,8}_[0-9]{1,6}"
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Cache over a fresh in-memory store.
pub fn memory_cache(config: CacheConfig) -> Arc<MultiTierCache<InMemoryDurableStore>> {
    let cache = MultiTierCache::new(Arc::new(InMemoryDurableStore::new()), config)
        .expect("fixture cache config should validate");
    Arc::new(cache)
}

/// `count` legacy keys `legacy_<i>` with their canonical targets
/// `fund:detail:<i>:v1`, zero-padded so the targets sort in order.
pub fn legacy_pairs(count: usize) -> Vec<(String, String)> {
    (0..count)
        .map(|i| {
            (
                format!("legacy_{:06}", i),
                format!("fund:detail:{:06}:v1", i),
            )
        })
        .collect()
}

/// Value stored under the `i`th legacy key.
pub fn legacy_value(i: usize) -> Vec<u8> {
    format!("{{\"nav\":{}}}", i).into_bytes()
}

/// Write `legacy_value(i)` under every old key of `pairs`.
pub async fn seed_legacy<S: DurableStore>(
    cache: &MultiTierCache<S>,
    pairs: &[(String, String)],
) -> CacheResult<()> {
    for (i, (old_key, _)) in pairs.iter().enumerate() {
        cache.put(old_key, legacy_value(i), None).await?;
    }
    Ok(())
}

/// The favorites list used across scenario tests.
pub fn favorites_fixture() -> Vec<String> {
    vec!["000001".to_string(), "000002".to_string()]
}

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Operations a [`FlakyStore`] can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Read,
    Write,
    Delete,
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    prefix: String,
    /// Failures left, or `None` for no limit.
    remaining: Option<AtomicU64>,
}

impl Fault {
    fn fires(&self, op: FaultOp, key: &str) -> bool {
        if self.op != op || !key.starts_with(&self.prefix) {
            return false;
        }
        match &self.remaining {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok(),
        }
    }
}

/// Durable store wrapper that fails selected operations on selected keys.
///
/// ```ignore
/// let audit = FlakyStore::new(InMemoryDurableStore::new())
///     .fail(FaultOp::Write, "migration:backup:");
/// ```
#[derive(Debug)]
pub struct FlakyStore<S: DurableStore> {
    inner: S,
    faults: Vec<Fault>,
    injected: AtomicU64,
}

impl<S: DurableStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Vec::new(),
            injected: AtomicU64::new(0),
        }
    }

    /// Fail `op` for every key starting with `prefix`.
    pub fn fail(mut self, op: FaultOp, prefix: impl Into<String>) -> Self {
        self.faults.push(Fault {
            op,
            prefix: prefix.into(),
            remaining: None,
        });
        self
    }

    /// Fail `op` for keys starting with `prefix`, only the first `times` times.
    pub fn fail_times(mut self, op: FaultOp, prefix: impl Into<String>, times: u64) -> Self {
        self.faults.push(Fault {
            op,
            prefix: prefix.into(),
            remaining: Some(AtomicU64::new(times)),
        });
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Failures injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    fn check(&self, op: FaultOp, key: &str) -> CacheResult<()> {
        let hit = self.faults.iter().any(|f| f.fires(op, key));
        if !hit {
            return Ok(());
        }
        self.injected.fetch_add(1, Ordering::Relaxed);
        let reason = "injected fault".to_string();
        let key = key.to_string();
        Err(match op {
            FaultOp::Read => StorageError::Read { key, reason },
            FaultOp::Write => StorageError::Write { key, reason },
            FaultOp::Delete => StorageError::Delete { key, reason },
        }
        .into())
    }
}

#[async_trait]
impl<S: DurableStore> DurableStore for FlakyStore<S> {
    async fn read(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check(FaultOp::Read, key)?;
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, value: &[u8]) -> CacheResult<()> {
        self.check(FaultOp::Write, key)?;
        self.inner.write(key, value).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check(FaultOp::Delete, key)?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> CacheResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn clear(&self) -> CacheResult<u64> {
        self.inner.clear().await
    }
}
