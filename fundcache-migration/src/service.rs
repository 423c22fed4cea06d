//! Caller-facing facade over the cache and the migration engine.
//!
//! Construct one `CacheService` at startup and share it by `Arc`. Tests build
//! a fresh instance each.

use std::sync::Arc;
use std::time::Duration;

use fundcache_core::{
    CacheConfig, CacheResult, Conflict, ConflictConfig, MigrationConfig, MigrationError,
};
use fundcache_storage::{cleanup_task, CleanupMetrics, DurableStore, MultiTierCache};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backup::RollbackReport;
use crate::engine::{MigrationEngine, MigrationResult, MigrationStatus, ProgressCallback};
use crate::jobs::{progress_persist_task, ProgressPersistMetrics};
use crate::mapping::MigrationMapping;

/// Handles of the background jobs started by [`CacheService::spawn_jobs`].
pub struct BackgroundJobs {
    pub cleanup: JoinHandle<Arc<CleanupMetrics>>,
    pub progress: JoinHandle<Arc<ProgressPersistMetrics>>,
}

pub struct CacheService<S: DurableStore, A: DurableStore> {
    cache: Arc<MultiTierCache<S>>,
    engine: Arc<MigrationEngine<S, A>>,
}

impl<S: DurableStore + 'static, A: DurableStore + 'static> CacheService<S, A> {
    /// Build the cache over `store` and the engine over it, with records and
    /// backups kept in `audit`.
    pub fn new(
        store: Arc<S>,
        audit: Arc<A>,
        cache_config: CacheConfig,
        migration_config: MigrationConfig,
        conflict_config: ConflictConfig,
    ) -> CacheResult<Self> {
        let cache = Arc::new(MultiTierCache::new(store, cache_config)?);
        let engine = Arc::new(MigrationEngine::new(
            Arc::clone(&cache),
            audit,
            migration_config,
            conflict_config,
        )?);
        Ok(Self { cache, engine })
    }

    /// Configuration from `FUNDCACHE_*` environment variables.
    pub fn from_env(store: Arc<S>, audit: Arc<A>) -> CacheResult<Self> {
        Self::new(
            store,
            audit,
            CacheConfig::from_env(),
            MigrationConfig::from_env(),
            ConflictConfig::from_env(),
        )
    }

    pub fn cache(&self) -> &Arc<MultiTierCache<S>> {
        &self.cache
    }

    pub fn engine(&self) -> &Arc<MigrationEngine<S, A>> {
        &self.engine
    }

    pub async fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).await
    }

    pub async fn cache_put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.cache.put(key, value, ttl).await
    }

    pub async fn cache_remove(&self, key: &str) -> CacheResult<bool> {
        self.cache.remove(key).await
    }

    pub async fn migrate(
        &self,
        mapping: &MigrationMapping,
        batch_size: Option<usize>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> CacheResult<MigrationResult> {
        self.engine.migrate_keys(mapping, batch_size, on_progress).await
    }

    /// Migrate only if preflight finds no high or critical conflict.
    pub async fn migrate_checked(
        &self,
        mapping: &MigrationMapping,
        batch_size: Option<usize>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> CacheResult<MigrationResult> {
        let blocking = self
            .engine
            .preflight(mapping)
            .await?
            .into_iter()
            .filter(Conflict::is_blocking)
            .count();
        if blocking > 0 {
            tracing::warn!(blocking, "migration refused by preflight");
            return Err(MigrationError::ConflictDetected { count: blocking }.into());
        }
        self.migrate(mapping, batch_size, on_progress).await
    }

    pub fn detect_conflicts<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Conflict> {
        self.engine.detector().detect(keys)
    }

    pub fn migration_status(&self) -> CacheResult<MigrationStatus> {
        self.engine.status()
    }

    pub fn pause_migration(&self) -> CacheResult<()> {
        self.engine.pause()
    }

    pub fn resume_migration(&self) -> CacheResult<()> {
        self.engine.resume()
    }

    pub async fn rollback_migration(&self) -> CacheResult<RollbackReport> {
        self.engine.rollback_migration().await
    }

    /// Start the expiry sweep and progress persistence on the current runtime.
    pub fn spawn_jobs(&self, shutdown_rx: watch::Receiver<bool>) -> BackgroundJobs {
        BackgroundJobs {
            cleanup: tokio::spawn(cleanup_task(
                Arc::clone(&self.cache),
                self.cache.config().cleanup_interval,
                shutdown_rx.clone(),
            )),
            progress: tokio::spawn(progress_persist_task(
                self.engine.progress(),
                self.engine.config().progress_persist_interval,
                shutdown_rx,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundcache_core::CacheError;
    use fundcache_storage::InMemoryDurableStore;

    fn service() -> CacheService<InMemoryDurableStore, InMemoryDurableStore> {
        CacheService::new(
            Arc::new(InMemoryDurableStore::new()),
            Arc::new(InMemoryDurableStore::new()),
            CacheConfig::new(),
            MigrationConfig::immediate(),
            ConflictConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cache_api() {
        let service = service();
        service.cache_put("fund:detail:1:v1", b"x".to_vec(), None).await.unwrap();
        assert_eq!(service.cache_get("fund:detail:1:v1").await, Some(b"x".to_vec()));
        assert!(service.cache_remove("fund:detail:1:v1").await.unwrap());
        assert_eq!(service.cache_get("fund:detail:1:v1").await, None);
    }

    #[tokio::test]
    async fn test_migrate_checked_refuses_blocking_conflicts() {
        let service = service();
        service.cache_put("legacy", b"x".to_vec(), None).await.unwrap();
        let mapping = MigrationMapping::from_pairs([("legacy", "not canonical")]);

        let err = service.migrate_checked(&mapping, None, None).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::Migration(MigrationError::ConflictDetected { count: 1 })
        ));
        assert_eq!(service.migration_status().unwrap(), MigrationStatus::NotStarted);
        assert_eq!(service.cache_get("legacy").await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_migrate_checked_runs_clean_mapping() {
        let service = service();
        service.cache_put("legacy", b"x".to_vec(), None).await.unwrap();
        let mapping = MigrationMapping::from_pairs([("legacy", "fund:detail:legacy:v1")]);

        let result = service.migrate_checked(&mapping, None, None).await.unwrap();
        assert!(result.success);
        assert_eq!(service.migration_status().unwrap(), MigrationStatus::Completed);
    }

    #[tokio::test]
    async fn test_detect_conflicts_delegates() {
        let service = service();
        let conflicts = service.detect_conflicts(&["fund:detail:1:v1", "fund:detail:1:v2"]);
        assert!(!conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_jobs_stop_on_shutdown() {
        let service = service();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let jobs = service.spawn_jobs(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        let cleanup = jobs.cleanup.await.unwrap().snapshot();
        let progress = jobs.progress.await.unwrap().snapshot();
        assert!(cleanup.sweeps >= 1);
        assert_eq!(progress.errors, 0);
    }
}
