//! Prediction persistence.
//!
//! Records are keyed by `(pickup_location_id, pickup_hour)`. Whether a repeat
//! write for a key appends a duplicate or replaces the earlier record is an
//! explicit [`WriteMode`]; [`WriteMode::Append`] is the default.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::VersionedName;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub pickup_location_id: String,
    pub pickup_hour_ts_ms_utc: i64,
    pub predicted_rides: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Every write is kept; reruns can leave several records per key.
    Append,
    /// A write replaces any stored record sharing its key.
    Upsert,
}

impl WriteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Upsert => "upsert",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "append" => Some(Self::Append),
            "upsert" => Some(Self::Upsert),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub mode: WriteMode,
    /// When false the write returns without waiting for durable storage.
    pub wait_for_completion: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::Append,
            wait_for_completion: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("prediction write rejected: {0}")]
    Rejected(String),
}

pub trait PredictionSink {
    /// Writes one batch. A failure leaves no partial batch behind.
    fn insert(
        &mut self,
        records: &[PredictionRecord],
        options: &WriteOptions,
    ) -> Result<(), SinkError>;

    /// Most recent stored pickup hour within `[from, to]`, if any.
    fn latest_pickup_hour(
        &self,
        from_ts_ms_utc: i64,
        to_ts_ms_utc: i64,
    ) -> Result<Option<i64>, SinkError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPredictionSink {
    records: Vec<PredictionRecord>,
    batches: usize,
}

impl InMemoryPredictionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn count_for_key(&self, pickup_location_id: &str, pickup_hour_ts_ms_utc: i64) -> usize {
        self.records
            .iter()
            .filter(|r| {
                r.pickup_location_id == pickup_location_id
                    && r.pickup_hour_ts_ms_utc == pickup_hour_ts_ms_utc
            })
            .count()
    }
}

impl PredictionSink for InMemoryPredictionSink {
    fn insert(
        &mut self,
        records: &[PredictionRecord],
        options: &WriteOptions,
    ) -> Result<(), SinkError> {
        if options.mode == WriteMode::Upsert {
            self.records.retain(|existing| {
                !records.iter().any(|incoming| {
                    incoming.pickup_location_id == existing.pickup_location_id
                        && incoming.pickup_hour_ts_ms_utc == existing.pickup_hour_ts_ms_utc
                })
            });
        }
        self.records.extend_from_slice(records);
        self.batches += 1;
        Ok(())
    }

    fn latest_pickup_hour(
        &self,
        from_ts_ms_utc: i64,
        to_ts_ms_utc: i64,
    ) -> Result<Option<i64>, SinkError> {
        Ok(self
            .records
            .iter()
            .map(|r| r.pickup_hour_ts_ms_utc)
            .filter(|hour| (from_ts_ms_utc..=to_ts_ms_utc).contains(hour))
            .max())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPrediction {
    pub pickup_location_id: String,
    pub pickup_hour_ts_ms_utc: i64,
    pub predicted_rides: i32,
    pub inserted_at_ms_utc: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionQuery {
    pub location_id: Option<String>,
    pub from_ts_ms_utc: Option<i64>,
    pub to_ts_ms_utc: Option<i64>,
}

/// SQLite prediction table scoped to one prediction feature group.
pub struct SqlitePredictionStore {
    conn: Connection,
    group: VersionedName,
}

impl SqlitePredictionStore {
    pub fn open(path: &Path, group: VersionedName) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA temp_store=MEMORY;
            CREATE TABLE IF NOT EXISTS model_predictions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                feature_group TEXT NOT NULL,
                feature_group_version INTEGER NOT NULL,
                pickup_location_id TEXT NOT NULL,
                pickup_hour_ms INTEGER NOT NULL,
                predicted_rides INTEGER NOT NULL,
                inserted_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS model_predictions_by_key
                ON model_predictions(
                    feature_group,
                    feature_group_version,
                    pickup_location_id,
                    pickup_hour_ms
                );
            CREATE INDEX IF NOT EXISTS model_predictions_by_hour
                ON model_predictions(feature_group, feature_group_version, pickup_hour_ms);
            ",
        )?;

        Ok(Self { conn, group })
    }

    pub fn group(&self) -> &VersionedName {
        &self.group
    }

    pub fn count_rows(&self) -> Result<u64, SinkError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM model_predictions
            WHERE feature_group = ?1 AND feature_group_version = ?2
            ",
            params![self.group.name, self.group.version],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn count_for_key(
        &self,
        pickup_location_id: &str,
        pickup_hour_ts_ms_utc: i64,
    ) -> Result<u64, SinkError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM model_predictions
            WHERE feature_group = ?1
              AND feature_group_version = ?2
              AND pickup_location_id = ?3
              AND pickup_hour_ms = ?4
            ",
            params![
                self.group.name,
                self.group.version,
                pickup_location_id,
                pickup_hour_ts_ms_utc
            ],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Latest write per key, ordered by `(pickup_hour, pickup_location_id)`.
    pub fn query(&self, query: &PredictionQuery) -> Result<Vec<StoredPrediction>, SinkError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                p.pickup_location_id,
                p.pickup_hour_ms,
                p.predicted_rides,
                p.inserted_at_ms
            FROM model_predictions p
            JOIN (
                SELECT MAX(seq) AS seq
                FROM model_predictions
                WHERE feature_group = ?1 AND feature_group_version = ?2
                GROUP BY pickup_location_id, pickup_hour_ms
            ) latest ON latest.seq = p.seq
            WHERE (?3 IS NULL OR p.pickup_location_id = ?3)
              AND (?4 IS NULL OR p.pickup_hour_ms >= ?4)
              AND (?5 IS NULL OR p.pickup_hour_ms <= ?5)
            ORDER BY p.pickup_hour_ms ASC, p.pickup_location_id ASC
            ",
        )?;

        let rows = stmt.query_map(
            params![
                self.group.name,
                self.group.version,
                query.location_id,
                query.from_ts_ms_utc,
                query.to_ts_ms_utc
            ],
            |row| {
                Ok(StoredPrediction {
                    pickup_location_id: row.get(0)?,
                    pickup_hour_ts_ms_utc: row.get(1)?,
                    predicted_rides: row.get(2)?,
                    inserted_at_ms_utc: row.get(3)?,
                })
            },
        )?;

        rows.collect::<Result<Vec<_>, _>>().map_err(SinkError::from)
    }
}

impl PredictionSink for SqlitePredictionStore {
    fn insert(
        &mut self,
        records: &[PredictionRecord],
        options: &WriteOptions,
    ) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }

        let synchronous = if options.wait_for_completion {
            "FULL"
        } else {
            "OFF"
        };
        self.conn.pragma_update(None, "synchronous", synchronous)?;

        let inserted_at_ms = Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;
        {
            let mut delete = tx.prepare(
                "
                DELETE FROM model_predictions
                WHERE feature_group = ?1
                  AND feature_group_version = ?2
                  AND pickup_location_id = ?3
                  AND pickup_hour_ms = ?4
                ",
            )?;
            let mut insert = tx.prepare(
                "
                INSERT INTO model_predictions (
                    feature_group,
                    feature_group_version,
                    pickup_location_id,
                    pickup_hour_ms,
                    predicted_rides,
                    inserted_at_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )?;

            for record in records {
                if options.mode == WriteMode::Upsert {
                    delete.execute(params![
                        self.group.name,
                        self.group.version,
                        record.pickup_location_id,
                        record.pickup_hour_ts_ms_utc
                    ])?;
                }
                insert.execute(params![
                    self.group.name,
                    self.group.version,
                    record.pickup_location_id,
                    record.pickup_hour_ts_ms_utc,
                    record.predicted_rides,
                    inserted_at_ms
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "sink",
            event = "sink.insert",
            feature_group = %self.group,
            records = records.len(),
            mode = options.mode.as_str(),
            wait_for_completion = options.wait_for_completion
        );

        Ok(())
    }

    fn latest_pickup_hour(
        &self,
        from_ts_ms_utc: i64,
        to_ts_ms_utc: i64,
    ) -> Result<Option<i64>, SinkError> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "
                SELECT MAX(pickup_hour_ms)
                FROM model_predictions
                WHERE feature_group = ?1 AND feature_group_version = ?2
                  AND pickup_hour_ms BETWEEN ?3 AND ?4
                ",
                params![
                    self.group.name,
                    self.group.version,
                    from_ts_ms_utc,
                    to_ts_ms_utc
                ],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(latest)
    }
}

/// Read-only handle that opens its own connection per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlitePredictionReader {
    path: PathBuf,
    group: VersionedName,
}

impl SqlitePredictionReader {
    pub fn new(path: impl Into<PathBuf>, group: VersionedName) -> Self {
        Self {
            path: path.into(),
            group,
        }
    }

    pub fn read(&self, query: &PredictionQuery) -> Result<Vec<StoredPrediction>, SinkError> {
        SqlitePredictionStore::open(&self.path, self.group.clone())?.query(query)
    }
}
