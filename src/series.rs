//! Hourly ride-count observations and the sources that serve them.

use std::fs;
use std::path::Path;

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::VersionedName;

pub const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    pub location_id: String,
    pub hour_ts_ms_utc: i64,
    pub ride_count: u32,
}

impl Observation {
    pub fn new(location_id: impl Into<String>, hour_ts_ms_utc: i64, ride_count: u32) -> Self {
        Self {
            location_id: location_id.into(),
            hour_ts_ms_utc,
            ride_count,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid batch range: start {start_ts_ms_utc} is after end {end_ts_ms_utc}")]
    InvalidRange {
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored ride_count {value} for {location_id} at {hour_ts_ms_utc} is not a valid count")]
    InvalidRideCount {
        location_id: String,
        hour_ts_ms_utc: i64,
        value: i64,
    },
}

/// Supplies hourly observations for an inclusive `[start, end]` span.
///
/// An empty result is a valid answer for a span without data.
pub trait TimeSeriesSource {
    fn get_batch_data(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<Observation>, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySeriesSource {
    rows: Vec<Observation>,
}

impl InMemorySeriesSource {
    pub fn new(rows: Vec<Observation>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }
}

impl TimeSeriesSource for InMemorySeriesSource {
    fn get_batch_data(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<Observation>, SourceError> {
        validate_range(start_ts_ms_utc, end_ts_ms_utc)?;
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                row.hour_ts_ms_utc >= start_ts_ms_utc && row.hour_ts_ms_utc <= end_ts_ms_utc
            })
            .cloned()
            .collect())
    }
}

/// SQLite-backed hourly series, scoped to one feature view.
pub struct SqliteSeriesStore {
    conn: Connection,
    feature_view: VersionedName,
}

impl SqliteSeriesStore {
    pub fn open(path: &Path, feature_view: VersionedName) -> Result<Self, SourceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS series_hourly (
                feature_view TEXT NOT NULL,
                feature_view_version INTEGER NOT NULL,
                location_id TEXT NOT NULL,
                hour_ms INTEGER NOT NULL,
                ride_count INTEGER NOT NULL,
                PRIMARY KEY(feature_view, feature_view_version, location_id, hour_ms)
            ) WITHOUT ROWID;
            CREATE INDEX IF NOT EXISTS series_hourly_by_hour
                ON series_hourly(feature_view, feature_view_version, hour_ms);
            ",
        )?;

        info!(
            component = "series",
            event = "series.store.open",
            path = %path.display(),
            feature_view = %feature_view
        );

        Ok(Self { conn, feature_view })
    }

    pub fn feature_view(&self) -> &VersionedName {
        &self.feature_view
    }

    pub fn upsert_observations(&mut self, rows: &[Observation]) -> Result<usize, SourceError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO series_hourly (
                    feature_view,
                    feature_view_version,
                    location_id,
                    hour_ms,
                    ride_count
                ) VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(feature_view, feature_view_version, location_id, hour_ms)
                DO UPDATE SET ride_count = excluded.ride_count
                ",
            )?;

            for row in rows {
                stmt.execute(params![
                    self.feature_view.name,
                    self.feature_view.version,
                    row.location_id,
                    row.hour_ts_ms_utc,
                    row.ride_count,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "series",
            event = "series.store.upsert",
            feature_view = %self.feature_view,
            rows = rows.len()
        );

        Ok(rows.len())
    }

    pub fn count_range(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<u64, SourceError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM series_hourly
            WHERE feature_view = ?1
              AND feature_view_version = ?2
              AND hour_ms >= ?3
              AND hour_ms <= ?4
            ",
            params![
                self.feature_view.name,
                self.feature_view.version,
                start_ts_ms_utc,
                end_ts_ms_utc
            ],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

impl TimeSeriesSource for SqliteSeriesStore {
    fn get_batch_data(
        &self,
        start_ts_ms_utc: i64,
        end_ts_ms_utc: i64,
    ) -> Result<Vec<Observation>, SourceError> {
        validate_range(start_ts_ms_utc, end_ts_ms_utc)?;

        let mut stmt = self.conn.prepare(
            "
            SELECT location_id, hour_ms, ride_count
            FROM series_hourly
            WHERE feature_view = ?1
              AND feature_view_version = ?2
              AND hour_ms >= ?3
              AND hour_ms <= ?4
            ORDER BY location_id ASC, hour_ms ASC
            ",
        )?;
        let mut rows = stmt.query(params![
            self.feature_view.name,
            self.feature_view.version,
            start_ts_ms_utc,
            end_ts_ms_utc
        ])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let location_id: String = row.get(0)?;
            let hour_ts_ms_utc: i64 = row.get(1)?;
            let raw_count: i64 = row.get(2)?;
            let ride_count =
                u32::try_from(raw_count).map_err(|_| SourceError::InvalidRideCount {
                    location_id: location_id.clone(),
                    hour_ts_ms_utc,
                    value: raw_count,
                })?;
            out.push(Observation {
                location_id,
                hour_ts_ms_utc,
                ride_count,
            });
        }

        debug!(
            component = "series",
            event = "series.batch.read",
            feature_view = %self.feature_view,
            start = %format_hour(start_ts_ms_utc),
            end = %format_hour(end_ts_ms_utc),
            rows = out.len()
        );

        Ok(out)
    }
}

/// Canonical string form of a location id as written to prediction storage.
///
/// Trims whitespace and collapses integral numeric renderings such as `"5.0"`
/// to `"5"`.
pub fn canonical_location_id(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(integral) = trimmed.strip_suffix(".0") {
        if !integral.is_empty() && integral.chars().all(|c| c.is_ascii_digit()) {
            return integral.to_string();
        }
    }
    trimmed.to_string()
}

pub fn floor_to_hour_ms(ts_ms_utc: i64) -> i64 {
    ts_ms_utc.div_euclid(HOUR_MS) * HOUR_MS
}

pub fn format_hour(ts_ms_utc: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts_ms_utc.to_string())
}

fn validate_range(start_ts_ms_utc: i64, end_ts_ms_utc: i64) -> Result<(), SourceError> {
    if start_ts_ms_utc > end_ts_ms_utc {
        return Err(SourceError::InvalidRange {
            start_ts_ms_utc,
            end_ts_ms_utc,
        });
    }
    Ok(())
}
