//! Scheduler module for dispatching endpoint polls on their own intervals.

mod job;
mod shutdown;
#[cfg(test)]
mod testing;

pub use job::*;
pub use shutdown::*;

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// Scheduler registration errors. All of them prevent startup.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("endpoint {0} has a poll interval that is zero or longer than a year")]
    InvalidInterval(String),
    #[error("endpoint {0} is already scheduled")]
    DuplicateAlias(String),
    #[error("no endpoints scheduled")]
    NoJobs,
}

/// Longest accepted poll interval. Keeps every deadline the loop computes
/// representable as an `Instant`.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// What to do when an endpoint comes due while its previous execution is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Drop the dispatch; at most one execution per alias is in flight.
    #[default]
    Skip,
    /// Dispatch anyway.
    Allow,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Due-check period.
    pub tick: Duration,
    /// Dispatch every job once as soon as the loop starts.
    pub run_on_start: bool,
    pub overlap: OverlapPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            run_on_start: true,
            overlap: OverlapPolicy::Skip,
        }
    }
}

/// Per-endpoint dispatch counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub alias: String,
    pub dispatched: u64,
    pub skipped: u64,
}

/// Result of waiting for in-flight executions after the loop stopped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub aborted: usize,
}

struct ScheduledJob {
    job: Arc<EndpointJob>,
    interval: Duration,
    next_run: Instant,
    guard: Arc<Semaphore>,
    dispatched: u64,
    skipped: u64,
}

/// Runs one independent timer per endpoint and dispatches due jobs without
/// waiting for them.
pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    in_flight: JoinSet<JobOutcome>,
    shutdown: ShutdownCoordinator,
    settings: SchedulerSettings,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, shutdown: ShutdownCoordinator) -> Self {
        Self {
            jobs: Vec::new(),
            in_flight: JoinSet::new(),
            shutdown,
            settings,
        }
    }

    /// Register a job to fire every `interval`, counted from when the loop starts.
    pub fn schedule(&mut self, job: EndpointJob, interval: Duration) -> Result<(), SchedulerError> {
        if interval.is_zero() || interval > MAX_INTERVAL {
            return Err(SchedulerError::InvalidInterval(job.alias().to_string()));
        }
        if self.jobs.iter().any(|j| j.job.alias() == job.alias()) {
            return Err(SchedulerError::DuplicateAlias(job.alias().to_string()));
        }

        tracing::info!(alias = %job.alias(), "Scheduler: Adding endpoint every {:?}", interval);

        self.jobs.push(ScheduledJob {
            job: Arc::new(job),
            interval,
            next_run: Instant::now(),
            guard: Arc::new(Semaphore::new(1)),
            dispatched: 0,
            skipped: 0,
        });
        Ok(())
    }

    /// Run the due-check loop until shutdown is signaled.
    ///
    /// Returns as soon as the latch is observed; executions already dispatched
    /// keep running and can be awaited with [`Scheduler::drain`].
    pub async fn run_forever(&mut self) -> Result<(), SchedulerError> {
        if self.jobs.is_empty() {
            return Err(SchedulerError::NoJobs);
        }

        let start = Instant::now();
        for sj in &mut self.jobs {
            sj.next_run = if self.settings.run_on_start {
                start
            } else {
                start + sj.interval
            };
        }

        tracing::info!("Starting scheduler with {} endpoints", self.jobs.len());

        let shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                _ = ticker.tick() => {
                    self.dispatch_due(Instant::now());
                    self.reap();
                }
            }
        }

        tracing::info!(
            "Scheduler stopped dispatching; {} executions still in flight",
            self.in_flight.len()
        );
        Ok(())
    }

    /// Signal shutdown. `run_forever` returns on its next wakeup.
    ///
    /// `run_forever` holds `&mut self`, so this only works before or after the
    /// loop. To stop a running loop, signal a handle from [`Scheduler::stop_handle`].
    pub fn stop(&self) {
        self.shutdown.signal();
    }

    /// A handle to this scheduler's shutdown latch, usable while `run_forever` runs.
    pub fn stop_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> Vec<JobStats> {
        self.jobs
            .iter()
            .map(|sj| JobStats {
                alias: sj.job.alias().to_string(),
                dispatched: sj.dispatched,
                skipped: sj.skipped,
            })
            .collect()
    }

    fn dispatch_due(&mut self, now: Instant) {
        for sj in &mut self.jobs {
            if now < sj.next_run {
                continue;
            }
            if self.shutdown.is_signaled() {
                return;
            }

            // Stay on the job's own cadence; a late tick never queues catch-up runs.
            sj.next_run += sj.interval;
            if sj.next_run <= now {
                sj.next_run = now + sj.interval;
            }

            let permit = match self.settings.overlap {
                OverlapPolicy::Allow => None,
                OverlapPolicy::Skip => match sj.guard.clone().try_acquire_owned() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        sj.skipped += 1;
                        tracing::warn!(
                            alias = %sj.job.alias(),
                            "Skipping dispatch, previous execution still running"
                        );
                        continue;
                    }
                },
            };

            let job = sj.job.clone();
            sj.dispatched += 1;
            self.in_flight.spawn(async move { job.execute_guarded(permit).await });
        }
    }

    /// Collect finished executions so the set does not grow without bound.
    fn reap(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("Job execution aborted: {}", e);
            }
        }
    }

    /// Wait up to `timeout` for in-flight executions, aborting any left after it.
    pub async fn drain(&mut self, timeout: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let deadline = Instant::now() + timeout.min(MAX_INTERVAL);

        loop {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next()).await {
                Ok(Some(joined)) => {
                    if let Err(e) = joined {
                        tracing::error!("Job execution aborted: {}", e);
                    }
                    report.completed += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = self.in_flight.len();
                    tracing::warn!(
                        "Drain timed out after {:?}, aborting {} executions",
                        timeout,
                        report.aborted
                    );
                    self.in_flight.shutdown().await;
                    break;
                }
            }
        }

        report
    }
}
