//! File archive implementing the bounded-archive policy.
//!
//! Every poll becomes one immutable JSON unit named `{alias}_{captured_at}.json`.
//! After each write the oldest units of that alias are pruned until at most
//! `max_units` remain.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::models::PollResult;
use super::sink::{PersistError, PersistReport, PersistenceSink, PruneError};

/// Capture timestamp as embedded in unit file names. Sorts lexicographically.
const UNIT_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const UNIT_EXT: &str = ".json";

/// Default number of units kept per alias.
pub const DEFAULT_MAX_UNITS: usize = 20;

/// One archived poll on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveUnit {
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
    modified: Option<SystemTime>,
}

/// Directory-backed archive of poll results.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
    max_units: usize,
}

impl ArchiveStore {
    /// Create the archive, creating `dir` if needed. `max_units` is clamped to at least 1.
    pub fn new<P: AsRef<Path>>(dir: P, max_units: usize) -> Result<Self, PersistError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_units: max_units.max(1),
        })
    }

    pub fn max_units(&self) -> usize {
        self.max_units
    }

    fn unit_name(alias: &str, captured_at: DateTime<Utc>) -> String {
        format!("{}_{}{}", alias, captured_at.format(UNIT_TIME_FORMAT), UNIT_EXT)
    }

    /// Write one unit through a temp file so readers never see a partial unit.
    ///
    /// The unit is published with a hard link, which fails instead of
    /// replacing a unit that already exists.
    fn write_unit(&self, alias: &str, result: &PollResult) -> Result<PathBuf, PersistError> {
        let name = Self::unit_name(alias, result.captured_at);
        let path = self.dir.join(&name);
        let tmp = self.dir.join(format!(".{}.tmp", name));

        let body = serde_json::to_vec_pretty(result)?;
        fs::write(&tmp, body)?;
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);

        match linked {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(PersistError::UnitExists(path))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Units belonging to `alias`, oldest first.
    pub fn units_for(&self, alias: &str) -> Result<Vec<ArchiveUnit>, io::Error> {
        let prefix = format!("{}_", alias);
        let mut units = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(captured_at) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(UNIT_EXT))
                .and_then(parse_unit_time)
            else {
                continue;
            };

            units.push(ArchiveUnit {
                path: entry.path(),
                captured_at,
                modified: entry.metadata().and_then(|m| m.modified()).ok(),
            });
        }

        units.sort_by(|a, b| {
            a.captured_at
                .cmp(&b.captured_at)
                .then(a.modified.cmp(&b.modified))
                .then(a.path.cmp(&b.path))
        });
        Ok(units)
    }

    /// Read a unit back.
    pub fn load_unit(&self, unit: &ArchiveUnit) -> Result<PollResult, PersistError> {
        let body = fs::read(&unit.path)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Remove the oldest units of `alias` until at most `max_units` remain.
    /// `keep` is never a candidate, wherever its timestamp sorts.
    fn prune(&self, alias: &str, keep: &Path) -> (usize, Vec<PruneError>) {
        let units = match self.units_for(alias) {
            Ok(u) => u,
            Err(source) => {
                return (
                    0,
                    vec![PruneError {
                        path: self.dir.clone(),
                        source,
                    }],
                )
            }
        };

        let surplus = units.len().saturating_sub(self.max_units);
        let mut pruned = 0;
        let mut failures = Vec::new();

        for unit in units.into_iter().filter(|u| u.path.as_path() != keep).take(surplus) {
            match fs::remove_file(&unit.path) {
                Ok(()) => pruned += 1,
                Err(source) => failures.push(PruneError {
                    path: unit.path,
                    source,
                }),
            }
        }

        (pruned, failures)
    }
}

impl PersistenceSink for ArchiveStore {
    fn persist(&self, alias: &str, result: &PollResult) -> Result<PersistReport, PersistError> {
        let path = self.write_unit(alias, result)?;
        tracing::debug!(alias = %alias, "Archived {} items to {}", result.items.len(), path.display());

        let (pruned, prune_failures) = self.prune(alias, &path);
        Ok(PersistReport {
            stored: result.items.len(),
            pruned,
            prune_failures,
        })
    }

    fn check(&self) -> Result<(), PersistError> {
        let meta = fs::metadata(&self.dir)?;
        if meta.permissions().readonly() {
            return Err(PersistError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.dir.display()),
            )));
        }
        Ok(())
    }

    fn policy(&self) -> &'static str {
        "bounded-archive"
    }
}

fn parse_unit_time(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, UNIT_TIME_FORMAT)
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}
