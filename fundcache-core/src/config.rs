//! Configuration types
//!
//! Every struct has a `Default`, `with_*` builders, `validate()`, and a
//! `from_env()` constructor that reads `FUNDCACHE_*` variables and falls back
//! to the defaults for anything unset or unparsable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheError, CacheResult, ConfigError};
use crate::key::KNOWN_MODULES;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default L1 capacity in entries.
pub const DEFAULT_L1_CAPACITY: usize = 1000;

/// Default interval of the expired-entry sweep.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Default similarity at which two keys are reported as a possible typo.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Default number of mapping entries per migration batch.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default pause between migration batches.
pub const DEFAULT_BATCH_DELAY_MS: u64 = 20;

/// Default interval of the progress persistence job.
pub const DEFAULT_PROGRESS_PERSIST_INTERVAL_SECS: u64 = 5;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> CacheError {
    CacheError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// ============================================================================
// KEY CODEC
// ============================================================================

/// Key codec configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCodecConfig {
    /// Restrict `module` to `allowed_modules`.
    pub strict: bool,
    /// Modules accepted in strict mode.
    pub allowed_modules: Vec<String>,
}

impl Default for KeyCodecConfig {
    fn default() -> Self {
        Self {
            strict: true,
            allowed_modules: KNOWN_MODULES.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl KeyCodecConfig {
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_allowed_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Environment variables:
    /// - `FUNDCACHE_KEY_STRICT`: strict module checking (default: true)
    /// - `FUNDCACHE_KEY_MODULES`: comma-separated module list
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            strict: env_bool("FUNDCACHE_KEY_STRICT").unwrap_or(defaults.strict),
            allowed_modules: std::env::var("FUNDCACHE_KEY_MODULES")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(|m| m.trim().to_lowercase())
                        .filter(|m| !m.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.allowed_modules),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.strict && self.allowed_modules.is_empty() {
            return Err(invalid(
                "allowed_modules",
                "[]",
                "strict mode needs at least one module",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// L1 eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Evict the least recently accessed entry.
    #[default]
    Lru,
    /// Evict the earliest inserted entry, ignoring reads.
    Fifo,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "fifo" => Ok(Self::Fifo),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}

/// Multi-tier cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of L1 entries.
    pub l1_capacity: usize,
    /// Write through to, and read back from, the durable tier.
    pub l2_enabled: bool,
    /// L1 eviction policy.
    pub eviction_policy: EvictionPolicy,
    /// TTL applied by `put` when the caller passes none.
    pub default_ttl: Option<Duration>,
    /// Interval of the background expiry sweep.
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: DEFAULT_L1_CAPACITY,
            l2_enabled: true,
            eviction_policy: EvictionPolicy::Lru,
            default_ttl: None,
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_l1_capacity(mut self, capacity: usize) -> Self {
        self.l1_capacity = capacity;
        self
    }

    pub fn with_l2(mut self, enabled: bool) -> Self {
        self.l2_enabled = enabled;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Environment variables:
    /// - `FUNDCACHE_L1_CAPACITY` (default: 1000)
    /// - `FUNDCACHE_L2_ENABLED` (default: true)
    /// - `FUNDCACHE_EVICTION_POLICY`: `lru` or `fifo` (default: lru)
    /// - `FUNDCACHE_DEFAULT_TTL_SECS` (default: unset, no expiry)
    /// - `FUNDCACHE_CLEANUP_INTERVAL_SECS` (default: 60)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            l1_capacity: env_parse("FUNDCACHE_L1_CAPACITY").unwrap_or(defaults.l1_capacity),
            l2_enabled: env_bool("FUNDCACHE_L2_ENABLED").unwrap_or(defaults.l2_enabled),
            eviction_policy: env_parse("FUNDCACHE_EVICTION_POLICY")
                .unwrap_or(defaults.eviction_policy),
            default_ttl: env_parse::<u64>("FUNDCACHE_DEFAULT_TTL_SECS")
                .map(Duration::from_secs)
                .or(defaults.default_ttl),
            cleanup_interval: env_parse::<u64>("FUNDCACHE_CLEANUP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.l1_capacity == 0 {
            return Err(invalid(
                "l1_capacity",
                self.l1_capacity,
                "l1_capacity must be greater than 0",
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(invalid(
                "cleanup_interval",
                format!("{:?}", self.cleanup_interval),
                "cleanup_interval must be positive",
            ));
        }
        if matches!(self.default_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(invalid(
                "default_ttl",
                "0s",
                "default_ttl must be positive when set",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// CONFLICT DETECTION
// ============================================================================

/// Preferred resolution for keys that differ only by version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VersionResolution {
    #[default]
    KeepLatest,
    Merge,
    NamespaceByTimestamp,
}

impl VersionResolution {
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::KeepLatest => "keep latest",
            Self::Merge => "merge",
            Self::NamespaceByTimestamp => "namespace by timestamp",
        }
    }

    /// All resolutions, this one first.
    pub fn ordered_suggestions(&self) -> Vec<String> {
        let mut all = vec![*self];
        for other in [Self::KeepLatest, Self::Merge, Self::NamespaceByTimestamp] {
            if other != *self {
                all.push(other);
            }
        }
        all.iter().map(|r| r.suggestion().to_string()).collect()
    }
}

impl std::str::FromStr for VersionResolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', ' '], "_").as_str() {
            "keep_latest" | "latest" => Ok(Self::KeepLatest),
            "merge" => Ok(Self::Merge),
            "namespace_by_timestamp" | "timestamp" => Ok(Self::NamespaceByTimestamp),
            other => Err(format!("unknown version resolution: {}", other)),
        }
    }
}

/// Conflict detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Normalized Levenshtein similarity at or above which two keys are flagged.
    pub similarity_threshold: f64,
    /// Resolution listed first in version conflict suggestions.
    pub version_resolution: VersionResolution,
    /// Key codec used by the format pass.
    pub codec: KeyCodecConfig,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            version_resolution: VersionResolution::KeepLatest,
            codec: KeyCodecConfig::default(),
        }
    }
}

impl ConflictConfig {
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_version_resolution(mut self, resolution: VersionResolution) -> Self {
        self.version_resolution = resolution;
        self
    }

    pub fn with_codec(mut self, codec: KeyCodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Environment variables:
    /// - `FUNDCACHE_SIMILARITY_THRESHOLD` (default: 0.8)
    /// - `FUNDCACHE_VERSION_RESOLUTION`: `keep_latest`, `merge`, `namespace_by_timestamp`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            similarity_threshold: env_parse("FUNDCACHE_SIMILARITY_THRESHOLD")
                .unwrap_or(defaults.similarity_threshold),
            version_resolution: env_parse("FUNDCACHE_VERSION_RESOLUTION")
                .unwrap_or(defaults.version_resolution),
            codec: KeyCodecConfig::from_env(),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(invalid(
                "similarity_threshold",
                self.similarity_threshold,
                "similarity_threshold must be between 0.0 and 1.0",
            ));
        }
        self.codec.validate()
    }
}

// ============================================================================
// MIGRATION
// ============================================================================

/// Migration engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Mapping entries per batch when the caller does not pass one.
    pub batch_size: usize,
    /// Sleep between batches.
    pub batch_delay: Duration,
    /// Interval of the progress persistence job.
    pub progress_persist_interval: Duration,
    /// Read the new key back after writing it.
    pub verify_writes: bool,
    /// Discard the backup snapshot after a fully successful run.
    pub discard_backup_on_success: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            progress_persist_interval: Duration::from_secs(
                DEFAULT_PROGRESS_PERSIST_INTERVAL_SECS,
            ),
            verify_writes: true,
            discard_backup_on_success: false,
        }
    }
}

impl MigrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_progress_persist_interval(mut self, interval: Duration) -> Self {
        self.progress_persist_interval = interval;
        self
    }

    pub fn with_verify_writes(mut self, verify: bool) -> Self {
        self.verify_writes = verify;
        self
    }

    pub fn with_discard_backup_on_success(mut self, discard: bool) -> Self {
        self.discard_backup_on_success = discard;
        self
    }

    /// A configuration with no inter-batch delay, for tests and tooling.
    pub fn immediate() -> Self {
        Self::default().with_batch_delay(Duration::ZERO)
    }

    /// Environment variables:
    /// - `FUNDCACHE_MIGRATION_BATCH_SIZE` (default: 50)
    /// - `FUNDCACHE_MIGRATION_BATCH_DELAY_MS` (default: 20)
    /// - `FUNDCACHE_PROGRESS_PERSIST_INTERVAL_SECS` (default: 5)
    /// - `FUNDCACHE_MIGRATION_VERIFY_WRITES` (default: true)
    /// - `FUNDCACHE_MIGRATION_DISCARD_BACKUP` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("FUNDCACHE_MIGRATION_BATCH_SIZE")
                .unwrap_or(defaults.batch_size),
            batch_delay: env_parse::<u64>("FUNDCACHE_MIGRATION_BATCH_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.batch_delay),
            progress_persist_interval: env_parse::<u64>(
                "FUNDCACHE_PROGRESS_PERSIST_INTERVAL_SECS",
            )
            .map(Duration::from_secs)
            .unwrap_or(defaults.progress_persist_interval),
            verify_writes: env_bool("FUNDCACHE_MIGRATION_VERIFY_WRITES")
                .unwrap_or(defaults.verify_writes),
            discard_backup_on_success: env_bool("FUNDCACHE_MIGRATION_DISCARD_BACKUP")
                .unwrap_or(defaults.discard_backup_on_success),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.batch_size == 0 {
            return Err(invalid(
                "batch_size",
                self.batch_size,
                "batch_size must be greater than 0",
            ));
        }
        if self.progress_persist_interval.is_zero() {
            return Err(invalid(
                "progress_persist_interval",
                format!("{:?}", self.progress_persist_interval),
                "progress_persist_interval must be positive",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
