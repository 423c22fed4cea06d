//! Migration progress tracking and ETA.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fundcache_core::{CacheResult, StorageError};
use fundcache_storage::DurableStore;
use serde::{Deserialize, Serialize};

/// Audit-store key holding the most recent report.
pub const PROGRESS_KEY: &str = "migration:progress:latest";

/// Progress at one point in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub run_id: String,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    /// Processed share of the run, 0.0 to 100.0.
    pub percentage: f64,
    /// `None` until at least one item was processed.
    pub estimated_time_remaining_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressReport {
    pub fn processed(&self) -> usize {
        self.completed_items + self.failed_items
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.estimated_time_remaining_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    run_id: String,
    total: usize,
    completed: usize,
    failed: usize,
    started: Option<Instant>,
    history: Vec<ProgressReport>,
    dirty: bool,
}

impl TrackerState {
    fn report(&self) -> ProgressReport {
        let processed = self.completed + self.failed;
        let percentage = if self.total == 0 {
            100.0
        } else {
            (processed as f64 / self.total as f64 * 100.0).min(100.0)
        };

        let estimated_time_remaining_ms = match self.started {
            Some(started) if processed > 0 => {
                let remaining = self.total.saturating_sub(processed) as f64;
                let per_item_ms = started.elapsed().as_millis() as f64 / processed as f64;
                Some((per_item_ms * remaining).round() as u64)
            }
            _ => None,
        };

        ProgressReport {
            run_id: self.run_id.clone(),
            total_items: self.total,
            completed_items: self.completed,
            failed_items: self.failed,
            percentage,
            estimated_time_remaining_ms,
            timestamp: Utc::now(),
        }
    }
}

/// Records progress snapshots for the current run.
pub struct ProgressTracker<A: DurableStore> {
    audit: Arc<A>,
    state: RwLock<TrackerState>,
}

impl<A: DurableStore> ProgressTracker<A> {
    pub fn new(audit: Arc<A>) -> Self {
        Self {
            audit,
            state: RwLock::new(TrackerState::default()),
        }
    }

    /// Reset for a new run of `total` items.
    pub fn start(&self, run_id: &str, total: usize) -> CacheResult<ProgressReport> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        *state = TrackerState {
            run_id: run_id.to_string(),
            total,
            started: Some(Instant::now()),
            dirty: true,
            ..TrackerState::default()
        };
        let report = state.report();
        state.history.push(report.clone());
        Ok(report)
    }

    /// Record running totals and append a snapshot.
    pub fn update(&self, completed: usize, failed: usize) -> CacheResult<ProgressReport> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        state.completed = completed;
        state.failed = failed;
        state.dirty = true;
        let report = state.report();
        state.history.push(report.clone());
        Ok(report)
    }

    /// Current progress without recording a snapshot.
    pub fn report(&self) -> CacheResult<ProgressReport> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.report())
    }

    /// Snapshots recorded since the last `start`.
    pub fn history(&self) -> CacheResult<Vec<ProgressReport>> {
        let state = self.state.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.history.clone())
    }

    /// Write the current report if anything changed since the last persist.
    /// Returns whether a write happened.
    pub async fn persist(&self) -> CacheResult<bool> {
        let report = {
            let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
            if !state.dirty || state.started.is_none() {
                return Ok(false);
            }
            state.dirty = false;
            state.report()
        };

        let bytes = serde_json::to_vec(&report).map_err(|e| StorageError::Encoding {
            reason: e.to_string(),
        })?;
        if let Err(e) = self.audit.write(PROGRESS_KEY, &bytes).await {
            if let Ok(mut state) = self.state.write() {
                state.dirty = true;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// The last persisted report, e.g. from a run that crashed.
    pub async fn load_last(&self) -> CacheResult<Option<ProgressReport>> {
        match self.audit.read(PROGRESS_KEY).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
