//! Stub collaborators for scheduler and job tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::{
    Credentials, EndpointDescriptor, PersistError, PersistReport, PersistenceSink, PollResult,
    Scheme, SensorItem,
};
use crate::probe::{FetchError, Fetcher};

pub fn endpoint(alias: &str, interval_secs: u64) -> EndpointDescriptor {
    EndpointDescriptor {
        alias: alias.to_string(),
        host: "prtg.invalid".to_string(),
        port: 443,
        scheme: Scheme::Https,
        credentials: Credentials::Token("token".to_string()),
        verify_tls: true,
        interval: Duration::from_secs(interval_secs),
    }
}

/// Returns one sensor per call, optionally failing or stalling for some aliases.
#[derive(Default)]
pub struct StubFetcher {
    calls: AtomicUsize,
    failing: HashSet<String>,
    delay: Option<Duration>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, alias: &str) -> Self {
        self.failing.insert(alias.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(
        &self,
        endpoint: &EndpointDescriptor,
        _timeout: Duration,
    ) -> Result<PollResult, FetchError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&endpoint.alias) {
            return Err(FetchError::Network("connection refused".to_string()));
        }
        Ok(PollResult::new(
            endpoint.alias.clone(),
            vec![SensorItem {
                id: n as i64,
                name: endpoint.alias.clone(),
                status: "Down".to_string(),
                status_code: Some(5),
                message: String::new(),
                last_value: "-".to_string(),
                priority: Some(3),
            }],
        ))
    }
}

/// Records every persist call as `(alias, result)`, optionally blocking the
/// calling thread first.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<(String, PollResult)>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Highest number of persist calls that were running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<(String, PollResult)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_for(&self, alias: &str) -> usize {
        self.calls().iter().filter(|(a, _)| a == alias).count()
    }
}

impl PersistenceSink for RecordingSink {
    fn persist(&self, alias: &str, result: &PollResult) -> Result<PersistReport, PersistError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PersistError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected failure",
            )));
        }
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.calls
            .lock()
            .unwrap()
            .push((alias.to_string(), result.clone()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(PersistReport {
            stored: result.items.len(),
            ..Default::default()
        })
    }

    fn check(&self) -> Result<(), PersistError> {
        Ok(())
    }

    fn policy(&self) -> &'static str {
        "recording"
    }
}
