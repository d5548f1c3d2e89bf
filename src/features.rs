//! Sliding-window lag features over hourly ride counts.
//!
//! A window anchored at hour `h` covers the `W` lag hours `h..h+W-1` plus the
//! target hour `h+W`. It yields a [`FeatureRow`] only when every one of those
//! `W + 1` hours has exactly one observation for the location.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::series::{format_hour, Observation, HOUR_MS};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const TARGET_PLACEHOLDER_COLUMN: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    I64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub window_size: usize,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn has_target_placeholder(&self) -> bool {
        self.column_index(TARGET_PLACEHOLDER_COLUMN).is_some()
    }
}

/// `lags[k - 1]` holds `lag_k`, the count observed `k` hours before the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub location_id: String,
    pub target_hour_ts_ms_utc: i64,
    pub lags: Vec<i64>,
}

impl FeatureRow {
    pub fn lag(&self, k: usize) -> Option<i64> {
        if k == 0 {
            return None;
        }
        self.lags.get(k - 1).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_observations: u64,
    pub locations: u64,
    pub output_rows: u64,
    pub skipped_locations: u64,
    pub gap_windows: u64,
    pub duplicate_hours: u64,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature window config: {0}")]
    InvalidConfig(String),
    #[error("feature row for {location_id} has {found} lags, schema expects {expected}")]
    LagWidthMismatch {
        location_id: String,
        expected: usize,
        found: usize,
    },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn lag_column_name(k: usize) -> String {
    format!("lag_{k}")
}

pub fn build_feature_schema(window_size: usize, include_target_placeholder: bool) -> FeatureSchema {
    let mut columns: Vec<FeatureColumn> = (1..=window_size)
        .map(|k| FeatureColumn {
            name: lag_column_name(k),
            dtype: FeatureDType::I64,
        })
        .collect();

    if include_target_placeholder {
        columns.push(FeatureColumn {
            name: TARGET_PLACEHOLDER_COLUMN.to_string(),
            dtype: FeatureDType::I64,
        });
    }

    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, window_size, &columns);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        window_size,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

pub fn build_window_features(
    observations: &[Observation],
    window_size: usize,
    step_size: usize,
) -> Result<Vec<FeatureRow>, FeatureError> {
    build_window_features_with_report(observations, window_size, step_size).map(|(rows, _)| rows)
}

pub fn build_window_features_with_report(
    observations: &[Observation],
    window_size: usize,
    step_size: usize,
) -> Result<(Vec<FeatureRow>, FeatureBuildReport), FeatureError> {
    let spans = validate_window(window_size, step_size)?;

    let mut sorted: Vec<&Observation> = observations.iter().collect();
    sorted.sort_by(|a, b| {
        a.location_id
            .cmp(&b.location_id)
            .then(a.hour_ts_ms_utc.cmp(&b.hour_ts_ms_utc))
            .then(a.ride_count.cmp(&b.ride_count))
    });

    let mut report = FeatureBuildReport {
        input_observations: observations.len() as u64,
        ..FeatureBuildReport::default()
    };
    let mut rows = Vec::new();

    for segment in sorted.chunk_by(|a, b| a.location_id == b.location_id) {
        report.locations += 1;
        let before = rows.len();
        build_location_windows(segment, window_size, spans, &mut report, &mut rows);
        if rows.len() == before {
            report.skipped_locations += 1;
        }
    }

    report.output_rows = rows.len() as u64;

    debug!(
        component = "features",
        event = "features.build.finish",
        window_size,
        step_size,
        input_observations = report.input_observations,
        locations = report.locations,
        output_rows = report.output_rows,
        skipped_locations = report.skipped_locations,
        gap_windows = report.gap_windows,
        duplicate_hours = report.duplicate_hours
    );

    Ok((rows, report))
}

/// Predictor input: one `f64` row per [`FeatureRow`], columns in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub schema: FeatureSchema,
    pub location_ids: Vec<String>,
    pub target_hours_ts_ms_utc: Vec<i64>,
    pub values: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn from_rows(rows: &[FeatureRow], schema: &FeatureSchema) -> Result<Self, FeatureError> {
        let with_target = schema.has_target_placeholder();
        let mut values = Vec::with_capacity(rows.len());

        for row in rows {
            if row.lags.len() != schema.window_size {
                return Err(FeatureError::LagWidthMismatch {
                    location_id: row.location_id.clone(),
                    expected: schema.window_size,
                    found: row.lags.len(),
                });
            }

            let mut out: Vec<f64> = row.lags.iter().map(|lag| *lag as f64).collect();
            if with_target {
                out.push(0.0);
            }
            values.push(out);
        }

        Ok(Self {
            schema: schema.clone(),
            location_ids: rows.iter().map(|row| row.location_id.clone()).collect(),
            target_hours_ts_ms_utc: rows.iter().map(|row| row.target_hour_ts_ms_utc).collect(),
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.column_index(name)
    }
}

fn build_location_windows(
    segment: &[&Observation],
    window_size: usize,
    (span_ms, step_ms): (i64, i64),
    report: &mut FeatureBuildReport,
    out: &mut Vec<FeatureRow>,
) {
    let (Some(first), Some(last)) = (segment.first(), segment.last()) else {
        return;
    };
    if segment.len() < window_size + 1 {
        return;
    }

    let mut counts: BTreeMap<i64, u32> = BTreeMap::new();
    let mut duplicated: BTreeSet<i64> = BTreeSet::new();
    for obs in segment {
        if counts.insert(obs.hour_ts_ms_utc, obs.ride_count).is_some() {
            duplicated.insert(obs.hour_ts_ms_utc);
        }
    }
    report.duplicate_hours += duplicated.len() as u64;

    let mut start = first.hour_ts_ms_utc;

    while let Some(target) = start
        .checked_add(span_ms)
        .filter(|target| *target <= last.hour_ts_ms_utc)
    {
        match window_lags(&counts, &duplicated, target, window_size) {
            Some(lags) => out.push(FeatureRow {
                location_id: first.location_id.clone(),
                target_hour_ts_ms_utc: target,
                lags,
            }),
            None => {
                report.gap_windows += 1;
                debug!(
                    component = "features",
                    event = "features.window.gap",
                    location_id = %first.location_id,
                    target_hour = %format_hour(target)
                );
            }
        }
        match start.checked_add(step_ms) {
            Some(next) => start = next,
            None => break,
        }
    }
}

fn window_lags(
    counts: &BTreeMap<i64, u32>,
    duplicated: &BTreeSet<i64>,
    target: i64,
    window_size: usize,
) -> Option<Vec<i64>> {
    let usable = |hour: i64| {
        if duplicated.contains(&hour) {
            None
        } else {
            counts.get(&hour).copied()
        }
    };

    usable(target)?;
    (1..=window_size)
        .map(|k| usable(target - k as i64 * HOUR_MS).map(i64::from))
        .collect()
}

/// Returns the window span and step in milliseconds.
fn validate_window(window_size: usize, step_size: usize) -> Result<(i64, i64), FeatureError> {
    if window_size == 0 {
        return Err(FeatureError::InvalidConfig(
            "window_size must be > 0".to_string(),
        ));
    }
    if step_size == 0 {
        return Err(FeatureError::InvalidConfig("step_size must be > 0".to_string()));
    }
    let span_ms = hours_to_ms(window_size).ok_or_else(|| {
        FeatureError::InvalidConfig(format!("window_size {window_size} is out of range"))
    })?;
    let step_ms = hours_to_ms(step_size).ok_or_else(|| {
        FeatureError::InvalidConfig(format!("step_size {step_size} is out of range"))
    })?;
    Ok((span_ms, step_ms))
}

fn hours_to_ms(hours: usize) -> Option<i64> {
    i64::try_from(hours).ok()?.checked_mul(HOUR_MS)
}

fn schema_fingerprint(version: u32, window_size: usize, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("window_size:{window_size};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":i64;");
    }
    hex::encode(hasher.finalize())
}
