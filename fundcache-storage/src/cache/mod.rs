//! Multi-tier cache runtime.
//!
//! An in-memory L1 tier ([`L1Tier`]) sits over a durable L2 tier (any
//! [`DurableStore`]). [`MultiTierCache`] ties them together with write-through
//! semantics, promotion on L2 hits, and lazy expiry.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(LmdbDurableStore::new("/var/lib/fundcache", 256)?);
//! let cache = MultiTierCache::new(store, CacheConfig::from_env())?;
//!
//! cache.put("fund:detail:000001:v1", bytes, Some(Duration::from_secs(300))).await?;
//! let hit = cache.get("fund:detail:000001:v1").await;
//! ```

pub mod l1;
pub mod lmdb_backend;
pub mod memory_backend;
pub mod multi_tier;
pub mod traits;

pub use l1::{L1Lookup, L1Tier};
pub use lmdb_backend::{LmdbDurableStore, LmdbStoreError, LmdbStoreStats};
pub use memory_backend::InMemoryDurableStore;
pub use multi_tier::{CleanupReport, MultiTierCache};
pub use traits::{CacheStats, DurableStore, ValueLoader};
