//! One endpoint's poll-and-persist cycle.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;

use super::ShutdownCoordinator;
use crate::db::{EndpointDescriptor, PersistError, PersistenceSink};
use crate::probe::{FetchError, Fetcher};

/// Reference fetch timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(30);

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Shutdown was already signaled; nothing was contacted.
    Skipped,
    FetchFailed,
    PersistFailed,
    Persisted { stored: usize, pruned: usize },
}

/// Binds an endpoint to its fetcher and sink. Executions never fail past
/// `execute`: every error is logged and folded into a [`JobOutcome`].
pub struct EndpointJob {
    endpoint: EndpointDescriptor,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn PersistenceSink>,
    shutdown: ShutdownCoordinator,
    fetch_timeout: Duration,
    persist_timeout: Duration,
}

impl EndpointJob {
    pub fn new(
        endpoint: EndpointDescriptor,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn PersistenceSink>,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            endpoint,
            fetcher,
            sink,
            shutdown,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, fetch_timeout: Duration, persist_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self.persist_timeout = persist_timeout;
        self
    }

    pub fn alias(&self) -> &str {
        &self.endpoint.alias
    }

    /// Run one cycle: fetch, then hand the result to the sink.
    pub async fn execute(&self) -> JobOutcome {
        self.execute_guarded(None).await
    }

    /// Like [`EndpointJob::execute`], holding `guard` until the sink write has
    /// actually finished, even when the write outlives its timeout.
    pub async fn execute_guarded(&self, guard: Option<OwnedSemaphorePermit>) -> JobOutcome {
        let alias = self.alias();

        if self.shutdown.is_signaled() {
            tracing::debug!(alias = %alias, "Shutdown in progress, skipping poll");
            return JobOutcome::Skipped;
        }

        tracing::info!(alias = %alias, "Polling {}", self.endpoint.base_url());

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(&self.endpoint, self.fetch_timeout),
        )
        .await
        .unwrap_or(Err(FetchError::Timeout(self.fetch_timeout)));

        let result = match fetched {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(alias = %alias, network = e.is_network(), "Fetch failed: {}", e);
                return JobOutcome::FetchFailed;
            }
        };

        let item_count = result.items.len();
        let sink = self.sink.clone();
        let owned_alias = alias.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            sink.persist(&owned_alias, &result)
        });

        let persisted = match tokio::time::timeout(self.persist_timeout, handle).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => Err(PersistError::Join(e.to_string())),
            Err(_) => {
                // The write keeps running on the blocking pool and may still land.
                tracing::warn!(
                    alias = %alias,
                    "Persist exceeded {:?}; the write continues in the background",
                    self.persist_timeout
                );
                Err(PersistError::TimedOut)
            }
        };

        match persisted {
            Ok(report) => {
                for failure in &report.prune_failures {
                    tracing::warn!(alias = %alias, "Prune failed: {}", failure);
                }
                if item_count == 0 {
                    tracing::info!(alias = %alias, "No sensors in error state");
                }
                tracing::info!(
                    alias = %alias,
                    policy = self.sink.policy(),
                    "Stored {} items, pruned {} units",
                    report.stored,
                    report.pruned
                );
                JobOutcome::Persisted {
                    stored: report.stored,
                    pruned: report.pruned,
                }
            }
            Err(e) => {
                tracing::error!(alias = %alias, "Persist failed: {}", e);
                JobOutcome::PersistFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PersistReport, PollResult};
    use crate::scheduler::testing::{endpoint, RecordingSink, StubFetcher};
    use tokio::sync::Semaphore;

    fn job(fetcher: Arc<StubFetcher>, sink: Arc<dyn PersistenceSink>) -> (EndpointJob, ShutdownCoordinator) {
        let shutdown = ShutdownCoordinator::new();
        let job = EndpointJob::new(endpoint("alpha", 60), fetcher, sink, shutdown.clone());
        (job, shutdown)
    }

    #[tokio::test]
    async fn test_success_persists_once() {
        let fetcher = Arc::new(StubFetcher::new());
        let sink = RecordingSink::new();
        let (job, _) = job(fetcher.clone(), sink.clone());

        let outcome = job.execute().await;
        assert_eq!(outcome, JobOutcome::Persisted { stored: 1, pruned: 0 });

        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "alpha");
        assert_eq!(calls[0].1.items.len(), 1);
        assert_eq!(calls[0].1.items[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_shutdown_skips_before_fetch() {
        let fetcher = Arc::new(StubFetcher::new());
        let sink = RecordingSink::new();
        let (job, shutdown) = job(fetcher.clone(), sink.clone());

        shutdown.signal();
        assert_eq!(job.execute().await, JobOutcome::Skipped);
        assert_eq!(fetcher.calls(), 0);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_persist() {
        let fetcher = Arc::new(StubFetcher::new().failing("alpha"));
        let sink = RecordingSink::new();
        let (job, _) = job(fetcher.clone(), sink.clone());

        assert_eq!(job.execute().await, JobOutcome::FetchFailed);
        assert_eq!(fetcher.calls(), 1);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_hits_timeout() {
        let fetcher = Arc::new(StubFetcher::new().with_delay(Duration::from_secs(60)));
        let sink = RecordingSink::new();
        let (job, _) = job(fetcher.clone(), sink.clone());
        let job = job.with_timeouts(Duration::from_secs(15), Duration::from_secs(30));

        assert_eq!(job.execute().await, JobOutcome::FetchFailed);
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_poison_next_cycle() {
        let fetcher = Arc::new(StubFetcher::new());
        let sink = RecordingSink::new();
        let (job, _) = job(fetcher.clone(), sink.clone());

        sink.set_failing(true);
        assert_eq!(job.execute().await, JobOutcome::PersistFailed);

        sink.set_failing(false);
        assert_eq!(
            job.execute().await,
            JobOutcome::Persisted { stored: 1, pruned: 0 }
        );
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_persist_timeout_holds_guard_until_write_ends() {
        let fetcher = Arc::new(StubFetcher::new());
        let sink = RecordingSink::new();
        sink.set_delay(Duration::from_millis(300));
        let (job, _) = job(fetcher, sink.clone());
        let job = job.with_timeouts(Duration::from_secs(15), Duration::from_millis(50));

        let guard = Arc::new(Semaphore::new(1));
        let permit = guard.clone().try_acquire_owned().unwrap();
        assert_eq!(job.execute_guarded(Some(permit)).await, JobOutcome::PersistFailed);

        // Reported as failed, but the write is still running and still owns the guard.
        assert_eq!(guard.available_permits(), 0);
        assert!(sink.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(guard.available_permits(), 1);
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_guard_released_after_fetch_failure() {
        let fetcher = Arc::new(StubFetcher::new().failing("alpha"));
        let (job, _) = job(fetcher, RecordingSink::new());

        let guard = Arc::new(Semaphore::new(1));
        let permit = guard.clone().try_acquire_owned().unwrap();
        assert_eq!(job.execute_guarded(Some(permit)).await, JobOutcome::FetchFailed);
        assert_eq!(guard.available_permits(), 1);
    }

    struct PanickingSink;

    impl PersistenceSink for PanickingSink {
        fn persist(&self, _: &str, _: &PollResult) -> Result<PersistReport, PersistError> {
            panic!("sink exploded");
        }

        fn check(&self) -> Result<(), PersistError> {
            Ok(())
        }

        fn policy(&self) -> &'static str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_is_contained() {
        let fetcher = Arc::new(StubFetcher::new());
        let (job, _) = job(fetcher, Arc::new(PanickingSink));
        assert_eq!(job.execute().await, JobOutcome::PersistFailed);
    }
}
