//! Sink whose backing store is opened on first use.
//!
//! A store that cannot be opened at startup is retried on every later call,
//! so an unavailable database or directory only fails the cycles that hit it.

use std::sync::{Arc, Mutex};

use super::models::PollResult;
use super::sink::{PersistError, PersistReport, PersistenceSink};

type Opener = Box<dyn Fn() -> Result<Arc<dyn PersistenceSink>, PersistError> + Send + Sync>;

pub struct LazySink {
    policy: &'static str,
    open: Opener,
    inner: Mutex<Option<Arc<dyn PersistenceSink>>>,
}

impl LazySink {
    pub fn new<F>(policy: &'static str, open: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn PersistenceSink>, PersistError> + Send + Sync + 'static,
    {
        Self {
            policy,
            open: Box::new(open),
            inner: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().map(|i| i.is_some()).unwrap_or(false)
    }

    fn get(&self) -> Result<Arc<dyn PersistenceSink>, PersistError> {
        let mut inner = self.inner.lock().map_err(|_| PersistError::LockPoisoned)?;
        if let Some(sink) = inner.as_ref() {
            return Ok(sink.clone());
        }

        let sink = (self.open)()?;
        tracing::info!("Opened {} storage", self.policy);
        *inner = Some(sink.clone());
        Ok(sink)
    }
}

impl PersistenceSink for LazySink {
    fn persist(&self, alias: &str, result: &PollResult) -> Result<PersistReport, PersistError> {
        self.get()?.persist(alias, result)
    }

    fn check(&self) -> Result<(), PersistError> {
        self.get()?.check()
    }

    fn policy(&self) -> &'static str {
        self.policy
    }
}
