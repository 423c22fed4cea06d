//! fundcache Core - Keys, Entries, Errors, Configuration
//!
//! Pure data structures and pure functions shared by the cache runtime and
//! the migration engine. Nothing in this crate performs I/O.

pub mod config;
pub mod conflict;
pub mod entry;
pub mod error;
pub mod key;

pub use config::{
    CacheConfig, ConflictConfig, EvictionPolicy, KeyCodecConfig, MigrationConfig,
    VersionResolution,
};
pub use conflict::{Conflict, ConflictType, Severity};
pub use entry::CacheEntry;
pub use error::{
    CacheError, CacheResult, ConfigError, KeyError, MigrationError, StorageError,
};
pub use key::{CacheKey, KeyCodec, DEFAULT_VERSION, KNOWN_MODULES, MAX_KEY_LENGTH};

/// Generate a new time-sortable identifier for backups and migration runs.
pub fn new_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
