//! Key Migration Operator Binary
//!
//! Opens an LMDB-backed cache, screens a mapping for conflicts, migrates it,
//! and prints the resulting record as JSON to stdout.
//!
//! Usage:
//!   fundcache-migrate <store-dir> <mapping.json> [batch-size]
//!
//! Records, backups and progress are kept in `<store-dir>/audit`.
//! Set `FUNDCACHE_LOG_JSON=1` for JSON logs; `RUST_LOG` overrides the
//! default `fundcache=info` filter.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use fundcache_core::{CacheResult, ConfigError, Conflict, MigrationError};
use fundcache_migration::{CacheService, MigrationMapping, ProgressReport};
use fundcache_storage::LmdbDurableStore;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_MAP_SIZE_MB: usize = 256;

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fundcache=info,warn"));
    let json = std::env::var("FUNDCACHE_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to init subscriber: {}", e);
    }
}

fn usage() -> ExitCode {
    eprintln!("usage: fundcache-migrate <store-dir> <mapping.json> [batch-size]");
    ExitCode::from(64)
}

fn parse_batch_size(raw: Option<&String>) -> CacheResult<Option<usize>> {
    let Some(value) = raw else {
        return Ok(None);
    };
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::InvalidValue {
            field: "batch_size".to_string(),
            value: value.clone(),
            reason: "batch_size must be a positive integer".to_string(),
        }
        .into()),
    }
}

async fn run(args: &[String]) -> CacheResult<bool> {
    let store_dir = PathBuf::from(&args[0]);
    let mapping = MigrationMapping::from_json_file(&args[1])?;
    let batch_size = parse_batch_size(args.get(2))?;
    let map_size_mb = std::env::var("FUNDCACHE_LMDB_MAP_SIZE_MB")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAP_SIZE_MB);

    let store = Arc::new(LmdbDurableStore::new(&store_dir, map_size_mb)?);
    let audit = Arc::new(LmdbDurableStore::new(store_dir.join("audit"), map_size_mb)?);
    let service = CacheService::from_env(store, audit)?;

    tracing::info!(
        store = %store_dir.display(),
        pairs = mapping.len(),
        "Loaded migration mapping"
    );

    let conflicts = service.engine().preflight(&mapping).await?;
    for conflict in &conflicts {
        tracing::warn!(conflict = %conflict, "Preflight conflict");
    }
    let blocking: Vec<&Conflict> = conflicts.iter().filter(|c| c.is_blocking()).collect();
    if !blocking.is_empty() {
        println!("{}", serde_json::to_string_pretty(&blocking)?);
        return Err(MigrationError::ConflictDetected {
            count: blocking.len(),
        }
        .into());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = service.spawn_jobs(shutdown_rx);

    let on_progress = |report: &ProgressReport| {
        tracing::info!(
            completed = report.completed_items,
            failed = report.failed_items,
            total = report.total_items,
            percentage = %format!("{:.1}", report.percentage),
            eta_ms = ?report.estimated_time_remaining_ms,
            "Migration progress"
        );
    };
    let outcome = service.migrate(&mapping, batch_size, Some(&on_progress)).await;

    let _ = shutdown_tx.send(true);
    let _ = jobs.cleanup.await;
    let _ = jobs.progress.await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !(2..=3).contains(&args.len()) {
        return usage();
    }

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(error = %e, "Migration failed");
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
