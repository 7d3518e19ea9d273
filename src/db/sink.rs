//! The persistence contract shared by both retention policies.

use std::path::PathBuf;
use thiserror::Error;

use super::models::PollResult;

/// Errors that fail a persist call. The alias's previously stored state is
/// left intact whenever one of these is returned.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("archive unit already exists: {0}")]
    UnitExists(PathBuf),
    #[error("persist timed out")]
    TimedOut,
    #[error("persist task failed: {0}")]
    Join(String),
}

/// A failure to remove one surplus archive unit. Never fails the persist call.
#[derive(Error, Debug)]
#[error("failed to prune {path}: {source}")]
pub struct PruneError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// What a successful persist call did.
#[derive(Debug, Default)]
pub struct PersistReport {
    /// Items written for the alias.
    pub stored: usize,
    /// Archive units removed by pruning.
    pub pruned: usize,
    pub prune_failures: Vec<PruneError>,
}

/// Durably records poll results under one retention policy.
///
/// Implementations must be safe to call concurrently for different aliases.
/// Calls are blocking; the job runs them off the async runtime.
pub trait PersistenceSink: Send + Sync {
    /// Record `result` for `alias`, superseding or archiving as the policy dictates.
    fn persist(&self, alias: &str, result: &PollResult) -> Result<PersistReport, PersistError>;

    /// Verify the backing store is reachable.
    fn check(&self) -> Result<(), PersistError>;

    /// Short policy name for logs.
    fn policy(&self) -> &'static str;
}
