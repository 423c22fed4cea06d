//! Background Jobs
//!
//! - `progress_persist_task`: writes the latest migration progress to the
//!   audit store so a crashed run can report where it stopped.
//!
//! The cache expiry sweep lives in `fundcache_storage::cleanup_task`.
//! [`crate::CacheService::spawn_jobs`] starts both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fundcache_storage::DurableStore;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::progress::ProgressTracker;

/// Counters for the progress persistence task.
#[derive(Debug, Default)]
pub struct ProgressPersistMetrics {
    /// Ticks observed.
    pub ticks: AtomicU64,
    /// Reports actually written.
    pub writes: AtomicU64,
    /// Failed writes.
    pub errors: AtomicU64,
}

impl ProgressPersistMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProgressPersistSnapshot {
        ProgressPersistSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPersistSnapshot {
    pub ticks: u64,
    pub writes: u64,
    pub errors: u64,
}

/// Persist progress every `period` until `shutdown_rx` carries `true`.
///
/// Unchanged progress is not rewritten. A final persist runs on shutdown.
pub async fn progress_persist_task<A: DurableStore + 'static>(
    tracker: Arc<ProgressTracker<A>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ProgressPersistMetrics> {
    let metrics = Arc::new(ProgressPersistMetrics::new());

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = period.as_millis() as u64,
        "Progress persistence task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    persist_once(&tracker, &metrics).await;
                    tracing::info!("Progress persistence task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                metrics.ticks.fetch_add(1, Ordering::Relaxed);
                persist_once(&tracker, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        ticks = snapshot.ticks,
        writes = snapshot.writes,
        errors = snapshot.errors,
        "Progress persistence task completed"
    );

    metrics
}

async fn persist_once<A: DurableStore>(
    tracker: &ProgressTracker<A>,
    metrics: &ProgressPersistMetrics,
) {
    match tracker.persist().await {
        Ok(true) => {
            metrics.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(error = %e, "Failed to persist migration progress");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundcache_storage::InMemoryDurableStore;

    #[tokio::test]
    async fn test_persists_changes_and_stops() {
        let tracker = Arc::new(ProgressTracker::new(Arc::new(InMemoryDurableStore::new())));
        tracker.start("run-job", 10).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(progress_persist_task(
            Arc::clone(&tracker),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.update(4, 1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let metrics = handle.await.unwrap().snapshot();
        assert!(metrics.ticks >= 2);
        assert_eq!(metrics.writes, 2);
        assert_eq!(metrics.errors, 0);

        let last = tracker.load_last().await.unwrap().unwrap();
        assert_eq!(last.completed_items, 4);
        assert_eq!(last.failed_items, 1);
    }
}
