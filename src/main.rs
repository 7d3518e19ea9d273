//! prtg-poller - polls PRTG servers for sensors in an error state.
//!
//! Each configured endpoint runs on its own interval; results replace the
//! endpoint's previous snapshot in SQLite or land in a bounded file archive.

mod config;
mod db;
mod probe;
mod scheduler;

use config::{PollerConfig, StorageTarget};
use db::{ArchiveStore, LazySink, PersistenceSink, SqliteStore};
use probe::{Fetcher, PrtgFetcher};
use scheduler::{EndpointJob, Scheduler, ShutdownCoordinator};

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn main() -> Result<(), BoxError> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("prtg_poller=info".parse()?))
        .init();

    tracing::info!("Starting prtg-poller");

    let cfg = match PollerConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let grace = cfg.drain_timeout;
    let result = runtime.block_on(run(cfg));
    shutdown_runtime(runtime, grace);
    result
}

async fn run(cfg: PollerConfig) -> Result<(), BoxError> {
    let sink: Arc<dyn PersistenceSink> = Arc::new(open_sink(cfg.storage.clone()));
    match sink.check() {
        Ok(()) => tracing::info!("Storage check passed ({})", sink.policy()),
        Err(e) => tracing::warn!("Storage unavailable, continuing and retrying each cycle: {}", e),
    }

    let fetcher: Arc<dyn Fetcher> = Arc::new(PrtgFetcher::new()?);
    let shutdown = ShutdownCoordinator::new();
    tokio::spawn(scheduler::wait_for_signal(shutdown.clone()));

    let mut scheduler = Scheduler::new(cfg.scheduler.clone(), shutdown.clone());
    for endpoint in cfg.endpoints {
        let interval = endpoint.interval;
        let job = EndpointJob::new(endpoint, fetcher.clone(), sink.clone(), shutdown.clone())
            .with_timeouts(cfg.fetch_timeout, cfg.persist_timeout);
        scheduler.schedule(job, interval)?;
    }

    scheduler.run_forever().await?;

    let drained = scheduler.drain(cfg.drain_timeout).await;
    for stats in scheduler.stats() {
        tracing::info!(
            alias = %stats.alias,
            "Dispatched {} polls, skipped {}",
            stats.dispatched,
            stats.skipped
        );
    }
    tracing::info!(
        "prtg-poller stopped ({} executions drained, {} aborted)",
        drained.completed,
        drained.aborted
    );

    Ok(())
}

/// Blocking writes still stuck after the drain get `grace` to finish before
/// the process exits without them.
fn shutdown_runtime(runtime: Runtime, grace: Duration) {
    let started = std::time::Instant::now();
    runtime.shutdown_timeout(grace);
    tracing::debug!("Runtime shut down in {:?}", started.elapsed());
}

fn open_sink(storage: StorageTarget) -> LazySink {
    match storage {
        StorageTarget::Database { path } => {
            tracing::info!("Using database at {}", path.display());
            LazySink::new("replace-set", move || {
                let store: Arc<dyn PersistenceSink> = Arc::new(SqliteStore::new(&path)?);
                Ok(store)
            })
        }
        StorageTarget::Archive {
            output_dir,
            max_units_per_alias,
        } => {
            tracing::info!(
                "Archiving to {} (max {} per endpoint)",
                output_dir.display(),
                max_units_per_alias
            );
            LazySink::new("bounded-archive", move || {
                let store: Arc<dyn PersistenceSink> =
                    Arc::new(ArchiveStore::new(&output_dir, max_units_per_alias)?);
                Ok(store)
            })
        }
    }
}
