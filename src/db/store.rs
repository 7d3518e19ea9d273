//! SQLite store implementing the replace-set policy.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, types::Type, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::models::*;
use super::sink::{PersistError, PersistReport, PersistenceSink};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Thread-safe replace-set store: each alias's rows are superseded as a whole.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), PersistError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| PersistError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistError> {
        self.conn.lock().map_err(|_| PersistError::LockPoisoned)
    }

    /// Replace every stored row for `alias` with `items` in one transaction.
    ///
    /// Any failure rolls back, leaving the alias's previous rows in place.
    pub fn replace_readings(
        &self,
        alias: &str,
        items: &[SensorItem],
        captured_at: DateTime<Utc>,
    ) -> Result<usize, PersistError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let removed = tx.execute(
            "DELETE FROM sensor_readings WHERE server_alias = ?1",
            params![alias],
        )?;
        tracing::debug!(alias = %alias, "Removed {} previous readings", removed);

        {
            let mut stmt = tx.prepare(
                "INSERT INTO sensor_readings (server_alias, sensor_id, sensor_name, status, status_code, last_value, message, priority, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;

            let captured = captured_at.format(TIME_FORMAT).to_string();
            for item in items {
                stmt.execute(params![
                    alias,
                    item.id,
                    item.name,
                    item.status,
                    item.status_code,
                    item.last_value,
                    item.message,
                    item.priority,
                    captured,
                ])?;
            }
        }

        // Dropping `tx` without commit rolls back.
        tx.commit()?;
        Ok(items.len())
    }

    /// All stored readings for an alias, ordered by sensor id.
    pub fn readings_for(&self, alias: &str) -> Result<Vec<StoredReading>, PersistError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT server_alias, sensor_id, sensor_name, status, status_code, last_value, message, priority, captured_at
             FROM sensor_readings WHERE server_alias = ?1 ORDER BY sensor_id ASC",
        )?;

        let readings = stmt
            .query_map(params![alias], |row| {
                let time_str: String = row.get(8)?;
                let captured_at = parse_db_time(&time_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        8,
                        Type::Text,
                        format!("invalid captured_at {:?}", time_str).into(),
                    )
                })?;
                Ok(StoredReading {
                    alias: row.get(0)?,
                    item: SensorItem {
                        id: row.get(1)?,
                        name: row.get(2)?,
                        status: row.get(3)?,
                        status_code: row.get(4)?,
                        last_value: row.get(5)?,
                        message: row.get(6)?,
                        priority: row.get(7)?,
                    },
                    captured_at,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(readings)
    }

    /// Number of stored rows for an alias.
    pub fn count_for(&self, alias: &str) -> Result<i64, PersistError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM sensor_readings WHERE server_alias = ?1",
            params![alias],
            |r| r.get(0),
        )?)
    }
}

impl PersistenceSink for SqliteStore {
    fn persist(&self, alias: &str, result: &PollResult) -> Result<PersistReport, PersistError> {
        let stored = self.replace_readings(alias, &result.items, result.captured_at)?;
        Ok(PersistReport {
            stored,
            ..Default::default()
        })
    }

    fn check(&self) -> Result<(), PersistError> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?;
        Ok(())
    }

    fn policy(&self) -> &'static str {
        "replace-set"
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
