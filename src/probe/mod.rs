//! Probe module: fetching sensor tables from monitoring servers.

mod prtg;

pub use prtg::*;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::db::{EndpointDescriptor, PollResult};

/// Fetch error types.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded with status {status}")]
    Protocol { status: u16 },
    #[error("decode error: {0}")]
    Decode(String),
}

impl FetchError {
    /// Connection, TLS and timeout failures.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Network(_))
    }
}

/// Retrieves the current result set of one endpoint.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        endpoint: &EndpointDescriptor,
        timeout: Duration,
    ) -> Result<PollResult, FetchError>;
}
