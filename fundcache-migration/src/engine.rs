//! Batched, pausable key migration.
//!
//! # State machine
//!
//! ```text
//! NotStarted -> InProgress <-> Paused -> Completed | Failed -> RolledBack
//! ```
//!
//! A run snapshots every old key before mutating anything, then moves keys
//! batch by batch. Per-key failures are recorded and the run continues.
//! Engine-level failures (backup persistence, audit writes, poisoned state)
//! roll back from the snapshot, leave the engine `Failed`, and propagate.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use fundcache_core::{
    new_run_id, CacheResult, ConfigError, Conflict, ConflictConfig, ConflictType, MigrationConfig,
    MigrationError, Severity, StorageError,
};
use fundcache_storage::{DurableStore, MultiTierCache};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backup::{BackupManager, BackupSnapshot, RollbackReport};
use crate::conflict::ConflictDetector;
use crate::mapping::MigrationMapping;
use crate::progress::{ProgressReport, ProgressTracker};

/// Audit-store prefix for run records.
pub const RECORD_PREFIX: &str = "migration:record:";

/// Error reason recorded when the target of a pair is already occupied.
pub const TARGET_EXISTS: &str = "target key already exists";

pub fn record_key(run_id: &str) -> String {
    format!("{}{}", RECORD_PREFIX, run_id)
}

/// Lifecycle state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    NotStarted,
    InProgress,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    /// A run is executing (possibly paused).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress | Self::Paused)
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// One failed pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMigrationError {
    pub old_key: String,
    pub new_key: String,
    pub reason: String,
}

impl From<KeyMigrationError> for MigrationError {
    fn from(e: KeyMigrationError) -> Self {
        MigrationError::MigrationKeyError {
            old_key: e.old_key,
            new_key: e.new_key,
            reason: e.reason,
        }
    }
}

/// Outcome of one run. Immutable once built; persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub run_id: String,
    pub backup_id: Option<String>,
    pub total_keys: usize,
    pub migrated_keys: usize,
    pub failed_keys: usize,
    pub errors: Vec<KeyMigrationError>,
    pub duration_ms: u64,
    /// True iff `failed_keys == 0`.
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// What a caller gets back from a run.
pub type MigrationResult = MigrationRecord;

/// Progress callback invoked after every batch.
pub type ProgressCallback<'a> = &'a (dyn Fn(&ProgressReport) + Send + Sync);

enum PairOutcome {
    Moved,
    AlreadyAbsent,
}

/// Bookkeeping of the latest run, kept for `rollback_migration`.
#[derive(Debug, Default)]
struct RunState {
    run_id: String,
    snapshot: Option<BackupSnapshot>,
    moved: HashMap<String, String>,
    rollback_applied: bool,
}

impl RunState {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }
}

/// Orchestrates migrations over a shared cache.
pub struct MigrationEngine<S: DurableStore, A: DurableStore> {
    cache: Arc<MultiTierCache<S>>,
    audit: Arc<A>,
    backups: BackupManager<S, A>,
    progress: Arc<ProgressTracker<A>>,
    detector: ConflictDetector,
    config: MigrationConfig,
    status: RwLock<MigrationStatus>,
    paused: watch::Sender<bool>,
    last_run: tokio::sync::Mutex<Option<RunState>>,
}

impl<S: DurableStore, A: DurableStore> MigrationEngine<S, A> {
    pub fn new(
        cache: Arc<MultiTierCache<S>>,
        audit: Arc<A>,
        config: MigrationConfig,
        conflict_config: ConflictConfig,
    ) -> CacheResult<Self> {
        config.validate()?;
        conflict_config.validate()?;
        let (paused, _) = watch::channel(false);
        Ok(Self {
            backups: BackupManager::new(Arc::clone(&cache), Arc::clone(&audit)),
            progress: Arc::new(ProgressTracker::new(Arc::clone(&audit))),
            detector: ConflictDetector::new(conflict_config),
            cache,
            audit,
            config,
            status: RwLock::new(MigrationStatus::NotStarted),
            paused,
            last_run: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    pub fn backups(&self) -> &BackupManager<S, A> {
        &self.backups
    }

    /// Shared handle, e.g. for the persistence job.
    pub fn progress(&self) -> Arc<ProgressTracker<A>> {
        Arc::clone(&self.progress)
    }

    pub fn status(&self) -> CacheResult<MigrationStatus> {
        let status = self.status.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(*status)
    }

    fn set_status(&self, next: MigrationStatus) -> CacheResult<()> {
        let mut status = self.status.write().map_err(|_| StorageError::LockPoisoned)?;
        *status = next;
        Ok(())
    }

    /// Apply `transition` to the current status under the lock.
    fn transition<F>(&self, operation: &str, transition: F) -> CacheResult<MigrationStatus>
    where
        F: FnOnce(MigrationStatus) -> Option<MigrationStatus>,
    {
        let mut status = self.status.write().map_err(|_| StorageError::LockPoisoned)?;
        match transition(*status) {
            Some(next) => {
                *status = next;
                Ok(next)
            }
            None => Err(MigrationError::InvalidState {
                operation: operation.to_string(),
                status: status.to_string(),
            }
            .into()),
        }
    }

    /// Ask the running migration to stop before its next batch.
    pub fn pause(&self) -> CacheResult<()> {
        self.transition("pause", |status| match status {
            MigrationStatus::InProgress | MigrationStatus::Paused => Some(MigrationStatus::Paused),
            _ => None,
        })?;
        self.paused.send_replace(true);
        info!("migration paused");
        Ok(())
    }

    pub fn resume(&self) -> CacheResult<()> {
        self.transition("resume", |status| match status {
            MigrationStatus::InProgress | MigrationStatus::Paused => {
                Some(MigrationStatus::InProgress)
            }
            _ => None,
        })?;
        self.paused.send_replace(false);
        info!("migration resumed");
        Ok(())
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        if *rx.borrow() {
            debug!("migration waiting for resume");
        }
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Screen `mapping` before running it.
    ///
    /// Adds a `duplicate/critical` conflict for every target that already
    /// holds a value in the cache.
    pub async fn preflight(&self, mapping: &MigrationMapping) -> CacheResult<Vec<Conflict>> {
        let mut conflicts = self.detector.detect_mapping(mapping);
        for (old_key, new_key) in mapping.iter() {
            if old_key != new_key && self.cache.contains(new_key).await? {
                conflicts.push(
                    Conflict::new(
                        ConflictType::Duplicate,
                        Severity::Critical,
                        vec![old_key.to_string(), new_key.to_string()],
                        format!("{}: '{}'", TARGET_EXISTS, new_key),
                    )
                    .with_suggestions(["remove or rename the existing target first"]),
                );
            }
        }
        Ok(conflicts)
    }

    /// Move every pair of `mapping` from its old key to its new key.
    ///
    /// `batch_size` falls back to the configured default. `on_progress` is
    /// called after every batch.
    pub async fn migrate_keys(
        &self,
        mapping: &MigrationMapping,
        batch_size: Option<usize>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> CacheResult<MigrationRecord> {
        let batch_size = batch_size.unwrap_or(self.config.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "batch_size must be greater than 0".to_string(),
            }
            .into());
        }

        self.transition("migrate", |status| {
            (!status.is_active()).then_some(MigrationStatus::InProgress)
        })?;
        self.paused.send_replace(false);

        let mut run = RunState::new(new_run_id());
        info!(
            run_id = %run.run_id,
            total = mapping.len(),
            batch_size,
            "migration started"
        );

        match self.execute(mapping, batch_size, on_progress, &mut run).await {
            Ok(record) => {
                let next = if record.success {
                    MigrationStatus::Completed
                } else {
                    MigrationStatus::Failed
                };

                if record.success && self.config.discard_backup_on_success {
                    if let Some(snapshot) = run.snapshot.take() {
                        if let Err(e) = self.backups.discard(&snapshot.id).await {
                            warn!(backup_id = %snapshot.id, error = %e, "could not discard backup");
                        }
                    }
                }

                *self.last_run.lock().await = Some(run);
                self.set_status(next)?;
                info!(
                    run_id = %record.run_id,
                    migrated = record.migrated_keys,
                    failed = record.failed_keys,
                    status = %next,
                    "migration finished"
                );
                Ok(record)
            }
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "migration aborted, rolling back");
                self.rollback_run(&mut run).await;
                *self.last_run.lock().await = Some(run);
                self.set_status(MigrationStatus::Failed)?;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        mapping: &MigrationMapping,
        batch_size: usize,
        on_progress: Option<ProgressCallback<'_>>,
        run: &mut RunState,
    ) -> CacheResult<MigrationRecord> {
        let started = Instant::now();
        let started_at = Utc::now();
        self.progress.start(&run.run_id, mapping.len())?;

        let snapshot = self.backups.capture(&mapping.old_keys()).await;
        let backup_id = snapshot.id.clone();
        run.snapshot = Some(snapshot);
        if let Some(snapshot) = &run.snapshot {
            self.backups.persist(snapshot).await?;
        }

        let mut migrated = 0;
        let mut errors: Vec<KeyMigrationError> = Vec::new();
        let batch_count = mapping.len().div_ceil(batch_size);

        for (index, batch) in mapping.batches(batch_size).enumerate() {
            self.wait_while_paused().await;

            for (old_key, new_key) in batch {
                match self.migrate_pair(old_key, new_key, &mut run.moved).await {
                    Ok(PairOutcome::Moved) => migrated += 1,
                    Ok(PairOutcome::AlreadyAbsent) => migrated += 1,
                    Err(reason) => {
                        warn!(old_key = %old_key, new_key = %new_key, reason = %reason, "key migration failed");
                        errors.push(KeyMigrationError {
                            old_key: old_key.clone(),
                            new_key: new_key.clone(),
                            reason,
                        });
                    }
                }
            }

            let report = self.progress.update(migrated, errors.len())?;
            debug!(
                batch = index + 1,
                batches = batch_count,
                percentage = report.percentage,
                "batch finished"
            );
            if let Some(callback) = on_progress {
                callback(&report);
            }

            if index + 1 < batch_count && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        let record = MigrationRecord {
            run_id: run.run_id.clone(),
            backup_id: Some(backup_id),
            total_keys: mapping.len(),
            migrated_keys: migrated,
            failed_keys: errors.len(),
            success: errors.is_empty(),
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            completed_at: Utc::now(),
        };

        self.persist_record(&record).await?;
        if let Err(e) = self.progress.persist().await {
            warn!(error = %e, "could not persist final progress");
        }
        Ok(record)
    }

    /// Move one pair. Errors come back as the reason to record.
    ///
    /// The pair enters `moved` as soon as the new key is written, so a
    /// rollback removes the copy even when a later step of the move fails.
    async fn migrate_pair(
        &self,
        old_key: &str,
        new_key: &str,
        moved: &mut HashMap<String, String>,
    ) -> Result<PairOutcome, String> {
        let entry = match self.cache.get_entry(old_key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(PairOutcome::AlreadyAbsent),
            Err(e) => return Err(format!("failed to read old key: {}", e)),
        };
        if old_key == new_key {
            return Ok(PairOutcome::AlreadyAbsent);
        }

        match self.cache.contains(new_key).await {
            Ok(true) => return Err(TARGET_EXISTS.to_string()),
            Ok(false) => {}
            Err(e) => return Err(format!("failed to check target key: {}", e)),
        }

        self.cache
            .put_entry(new_key, entry.clone())
            .await
            .map_err(|e| format!("failed to write new key: {}", e))?;
        moved.insert(old_key.to_string(), new_key.to_string());

        if self.config.verify_writes {
            let verified = match self.cache.get_entry(new_key).await {
                Ok(Some(written)) => written.value == entry.value,
                Ok(None) => false,
                Err(e) => {
                    warn!(new_key = %new_key, error = %e, "verification read failed");
                    false
                }
            };
            if !verified {
                if let Err(e) = self.cache.remove(new_key).await {
                    warn!(new_key = %new_key, error = %e, "could not remove unverified key");
                }
                return Err("verification of new key failed".to_string());
            }
        }

        if let Err(e) = self.cache.remove(old_key).await {
            // keep a single copy under the old key
            if let Err(undo) = self.cache.remove(new_key).await {
                warn!(new_key = %new_key, error = %undo, "could not remove copy after failed delete");
            }
            return Err(format!("failed to delete old key: {}", e));
        }

        Ok(PairOutcome::Moved)
    }

    /// Restore the run's snapshot, removing only keys this run wrote.
    async fn rollback_run(&self, run: &mut RunState) -> Option<RollbackReport> {
        if run.rollback_applied {
            return None;
        }
        let snapshot = run.snapshot.as_ref()?;
        let moved = &run.moved;
        let report = self
            .backups
            .rollback(snapshot, |key| moved.get(key).cloned())
            .await;
        run.rollback_applied = report.is_complete();
        Some(report)
    }

    /// Undo the latest run from its retained snapshot and move to
    /// `RolledBack`.
    ///
    /// If the automatic rollback of a failed run already restored the
    /// snapshot, only the state changes. A partial restore leaves the engine
    /// in its previous state so the call can be retried.
    pub async fn rollback_migration(&self) -> CacheResult<RollbackReport> {
        let status = self.status()?;
        if matches!(
            status,
            MigrationStatus::NotStarted | MigrationStatus::InProgress | MigrationStatus::Paused
        ) {
            return Err(MigrationError::InvalidState {
                operation: "rollback".to_string(),
                status: status.to_string(),
            }
            .into());
        }

        let mut last_run = self.last_run.lock().await;
        let report = match last_run.as_mut() {
            Some(run) if !run.rollback_applied => {
                if run.snapshot.is_none() {
                    return Err(MigrationError::BackupNotFound {
                        id: run.run_id.clone(),
                    }
                    .into());
                }
                self.rollback_run(run)
                    .await
                    .unwrap_or_default()
                    .into_result()?
            }
            _ => RollbackReport::default(),
        };

        self.set_status(MigrationStatus::RolledBack)?;
        info!(restored = report.restored, "migration rolled back");
        Ok(report)
    }

    async fn persist_record(&self, record: &MigrationRecord) -> CacheResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|e| StorageError::Encoding {
            reason: e.to_string(),
        })?;
        self.audit.write(&record_key(&record.run_id), &bytes).await
    }

    pub async fn load_record(&self, run_id: &str) -> CacheResult<Option<MigrationRecord>> {
        match self.audit.read(&record_key(run_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every persisted record, oldest first.
    pub async fn list_records(&self) -> CacheResult<Vec<MigrationRecord>> {
        let mut records = Vec::new();
        for key in self.audit.keys_with_prefix(RECORD_PREFIX).await? {
            if let Some(bytes) = self.audit.read(&key).await? {
                records.push(serde_json::from_slice::<MigrationRecord>(&bytes)?);
            }
        }
        records.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(records)
    }
}
