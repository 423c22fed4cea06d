//! fundcache Migration - Conflict Detection, Backups, and Key Migration
//!
//! Moves cache entries from legacy key names to canonical
//! `module:type:identifier:version` keys. A run screens the mapping for
//! conflicts, snapshots affected entries, migrates in ordered batches with
//! pause/resume, and can be rolled back from the snapshot.

pub mod backup;
pub mod conflict;
pub mod engine;
pub mod jobs;
pub mod mapping;
pub mod progress;
pub mod service;

pub use backup::{BackupManager, BackupSnapshot, RollbackReport, BACKUP_PREFIX};
pub use conflict::ConflictDetector;
pub use engine::{
    KeyMigrationError, MigrationEngine, MigrationRecord, MigrationResult, MigrationStatus,
    ProgressCallback, RECORD_PREFIX, TARGET_EXISTS,
};
pub use jobs::{progress_persist_task, ProgressPersistMetrics, ProgressPersistSnapshot};
pub use mapping::MigrationMapping;
pub use progress::{ProgressReport, ProgressTracker, PROGRESS_KEY};
pub use service::{BackgroundJobs, CacheService};
