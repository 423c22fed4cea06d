//! Expiry Sweep Background Task
//!
//! Periodically calls [`MultiTierCache::cleanup`] so expired entries do not
//! accumulate in either tier. Reads already treat expired entries as misses;
//! the sweep only reclaims space.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(cleanup_task(
//!     Arc::clone(&cache),
//!     cache.config().cleanup_interval,
//!     shutdown_rx,
//! ));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::{DurableStore, MultiTierCache};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for the sweep task.
#[derive(Debug, Default)]
pub struct CleanupMetrics {
    /// Sweeps completed.
    pub sweeps: AtomicU64,
    /// Expired entries removed, counted per tier.
    pub entries_removed: AtomicU64,
    /// Sweeps that failed.
    pub sweep_errors: AtomicU64,
}

impl CleanupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CleanupSnapshot {
        CleanupSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            entries_removed: self.entries_removed.load(Ordering::Relaxed),
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CleanupMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupSnapshot {
    pub sweeps: u64,
    pub entries_removed: u64,
    pub sweep_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Sweep expired entries every `period` until `shutdown_rx` carries `true`.
///
/// The first sweep runs immediately. A failed sweep is logged and counted;
/// the task keeps running.
pub async fn cleanup_task<S: DurableStore + 'static>(
    cache: Arc<MultiTierCache<S>>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<CleanupMetrics> {
    let metrics = Arc::new(CleanupMetrics::new());

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(interval_ms = period.as_millis() as u64, "Cache cleanup task started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache cleanup task shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                sweep(&cache, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        entries_removed = snapshot.entries_removed,
        sweep_errors = snapshot.sweep_errors,
        "Cache cleanup task completed"
    );

    metrics
}

async fn sweep<S: DurableStore>(cache: &MultiTierCache<S>, metrics: &CleanupMetrics) {
    metrics.sweeps.fetch_add(1, Ordering::Relaxed);
    match cache.cleanup().await {
        Ok(report) => {
            metrics
                .entries_removed
                .fetch_add(report.total(), Ordering::Relaxed);
            if report.total() > 0 {
                tracing::info!(
                    l1_removed = report.l1_removed,
                    l2_removed = report.l2_removed,
                    "Removed expired cache entries"
                );
            } else {
                tracing::trace!("Cleanup sweep found nothing to remove");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Cache cleanup sweep failed");
            metrics.sweep_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
