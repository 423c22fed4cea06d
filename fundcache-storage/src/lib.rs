//! fundcache Storage - Durable Stores and the Multi-Tier Cache
//!
//! Defines the L2 durable store contract, its LMDB and in-memory
//! implementations, and the L1/L2 cache runtime built on them.

pub mod cache;
pub mod cleanup;

pub use cache::{
    CacheStats, CleanupReport, DurableStore, InMemoryDurableStore, L1Lookup, L1Tier,
    LmdbDurableStore, LmdbStoreError, LmdbStoreStats, MultiTierCache, ValueLoader,
};
pub use cleanup::{cleanup_task, CleanupMetrics, CleanupSnapshot};
