//! Pre-migration snapshots and rollback.
//!
//! A snapshot captures the entry (payload plus timestamps) of every key a
//! migration is about to touch. Snapshots are persisted as JSON in the audit
//! store under `migration:backup:<id>`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fundcache_core::{new_run_id, CacheEntry, CacheResult, MigrationError};
use fundcache_storage::{DurableStore, MultiTierCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Audit-store prefix for persisted snapshots.
pub const BACKUP_PREFIX: &str = "migration:backup:";

pub fn backup_key(id: &str) -> String {
    format!("{}{}", BACKUP_PREFIX, id)
}

/// Point-in-time copy of a set of cache entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Every key the snapshot was asked to cover, in request order.
    pub keys: Vec<String>,
    /// Entries of the keys that were present.
    pub items: BTreeMap<String, CacheEntry>,
    /// Keys that could not be read and are therefore not restorable.
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

impl BackupSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of restoring a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub restored: usize,
    pub failed: usize,
    /// `(key, reason)` for every failed restore.
    pub errors: Vec<(String, String)>,
}

impl RollbackReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// `RollbackPartialFailure` if any key failed to restore.
    pub fn into_result(self) -> CacheResult<Self> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(MigrationError::RollbackPartialFailure {
                restored: self.restored,
                failed: self.failed,
            }
            .into())
        }
    }
}

/// Creates, persists, restores and discards snapshots.
pub struct BackupManager<S: DurableStore, A: DurableStore> {
    cache: Arc<MultiTierCache<S>>,
    audit: Arc<A>,
}

impl<S: DurableStore, A: DurableStore> BackupManager<S, A> {
    pub fn new(cache: Arc<MultiTierCache<S>>, audit: Arc<A>) -> Self {
        Self { cache, audit }
    }

    /// Read every key into an in-memory snapshot.
    ///
    /// A key that fails to read is logged and skipped; it never aborts the
    /// capture.
    pub async fn capture(&self, keys: &[String]) -> BackupSnapshot {
        let started = Instant::now();
        let mut items = BTreeMap::new();
        let mut skipped = Vec::new();

        for key in keys {
            match self.cache.get_entry(key).await {
                Ok(Some(entry)) => {
                    items.insert(key.clone(), entry);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping key in backup");
                    skipped.push(key.clone());
                }
            }
        }

        BackupSnapshot {
            id: new_run_id(),
            timestamp: Utc::now(),
            keys: keys.to_vec(),
            items,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Write `snapshot` to the audit store.
    pub async fn persist(&self, snapshot: &BackupSnapshot) -> CacheResult<()> {
        let bytes = serde_json::to_vec(snapshot).map_err(|e| MigrationError::BackupFailure {
            reason: format!("failed to encode snapshot {}: {}", snapshot.id, e),
        })?;
        self.audit
            .write(&backup_key(&snapshot.id), &bytes)
            .await
            .map_err(|e| MigrationError::BackupFailure {
                reason: format!("failed to persist snapshot {}: {}", snapshot.id, e),
            })?;

        info!(
            backup_id = %snapshot.id,
            items = snapshot.items.len(),
            skipped = snapshot.skipped.len(),
            "backup persisted"
        );
        Ok(())
    }

    /// Capture and persist in one step.
    pub async fn create_backup(&self, keys: &[String]) -> CacheResult<BackupSnapshot> {
        let snapshot = self.capture(keys).await;
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    /// Load a persisted snapshot.
    pub async fn load(&self, id: &str) -> CacheResult<BackupSnapshot> {
        let bytes = self
            .audit
            .read(&backup_key(id))
            .await?
            .ok_or_else(|| MigrationError::BackupNotFound { id: id.to_string() })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Restore every captured entry under its original key.
    ///
    /// For each key, the post-migration key returned by `moved_to` is
    /// deleted first. Per-key failures are logged and counted; the rest of
    /// the snapshot is still restored.
    pub async fn rollback<F>(&self, snapshot: &BackupSnapshot, moved_to: F) -> RollbackReport
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut report = RollbackReport::default();

        for (key, entry) in &snapshot.items {
            if let Some(new_key) = moved_to(key).filter(|new_key| new_key != key) {
                if let Err(e) = self.cache.remove(&new_key).await {
                    warn!(key = %key, new_key = %new_key, error = %e, "rollback could not remove migrated key");
                    report.failed += 1;
                    report.errors.push((key.clone(), e.to_string()));
                    continue;
                }
            }

            match self.cache.put_entry(key, entry.clone()).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "rollback could not restore key");
                    report.failed += 1;
                    report.errors.push((key.clone(), e.to_string()));
                }
            }
        }

        info!(
            backup_id = %snapshot.id,
            restored = report.restored,
            failed = report.failed,
            "rollback finished"
        );
        report
    }

    /// Delete a persisted snapshot.
    pub async fn discard(&self, id: &str) -> CacheResult<()> {
        if !self.audit.delete(&backup_key(id)).await? {
            return Err(MigrationError::BackupNotFound { id: id.to_string() }.into());
        }
        debug!(backup_id = %id, "backup discarded");
        Ok(())
    }
}
