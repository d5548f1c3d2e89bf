//! Demand scoring capability and prediction finalization.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{assert_schema_compatible, lag_column_name, FeatureError, FeatureMatrix};

/// Opaque scoring function: one estimate per matrix row, in row order.
pub trait DemandPredictor {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, PredictorError>;
}

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("feature matrix is missing column {0}")]
    MissingColumn(String),
    #[error("feature matrix row {row} has {found} values, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("predictor returned {actual} estimates for {expected} rows")]
    OutputLength { expected: usize, actual: usize },
    #[error("predictor returned non-finite estimate {value} for row {row}")]
    NonFinite { row: usize, value: f64 },
    #[error("rounded estimate {value} for row {row} does not fit in a 32-bit integer")]
    OutOfRange { row: usize, value: f64 },
    #[error("incompatible feature schema: {0}")]
    Schema(#[from] FeatureError),
    #[error("model failure: {0}")]
    Model(String),
}

/// How rounded estimates below zero are treated before persisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegativePredictionPolicy {
    /// Persist negative estimates unchanged.
    Surface,
    /// Floor estimates at zero.
    ClampToZero,
}

impl NegativePredictionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Surface => "surface",
            Self::ClampToZero => "clamp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "surface" | "as_is" => Some(Self::Surface),
            "clamp" | "clamp_to_zero" => Some(Self::ClampToZero),
            _ => None,
        }
    }
}

/// The single place raw estimates become persisted integers.
///
/// Rounds to nearest with ties to even, applies `policy` to negative values and
/// requires the result to fit in `i32`.
pub fn finalize_prediction(
    row: usize,
    raw: f64,
    policy: NegativePredictionPolicy,
) -> Result<i32, PredictorError> {
    if !raw.is_finite() {
        return Err(PredictorError::NonFinite { row, value: raw });
    }

    let rounded = raw.round_ties_even();
    let adjusted = match policy {
        NegativePredictionPolicy::Surface => rounded,
        NegativePredictionPolicy::ClampToZero => rounded.max(0.0),
    };

    if adjusted < f64::from(i32::MIN) || adjusted > f64::from(i32::MAX) {
        return Err(PredictorError::OutOfRange {
            row,
            value: adjusted,
        });
    }

    Ok(adjusted as i32)
}

pub fn finalize_predictions(
    raw: &[f64],
    expected_rows: usize,
    policy: NegativePredictionPolicy,
) -> Result<Vec<i32>, PredictorError> {
    if raw.len() != expected_rows {
        return Err(PredictorError::OutputLength {
            expected: expected_rows,
            actual: raw.len(),
        });
    }

    raw.iter()
        .enumerate()
        .map(|(row, value)| finalize_prediction(row, *value, policy))
        .collect()
}

/// Linear model over lag columns: `intercept + sum(lag_weights[k-1] * lag_k)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagLinearModel {
    pub intercept: f64,
    pub lag_weights: Vec<f64>,
    #[serde(default)]
    pub feature_schema_version: Option<u32>,
    #[serde(default)]
    pub feature_schema_fingerprint: Option<String>,
}

impl LagLinearModel {
    pub fn new(intercept: f64, lag_weights: Vec<f64>) -> Self {
        Self {
            intercept,
            lag_weights,
            feature_schema_version: None,
            feature_schema_fingerprint: None,
        }
    }

    fn check_schema(&self, features: &FeatureMatrix) -> Result<(), PredictorError> {
        if let Some(fingerprint) = &self.feature_schema_fingerprint {
            let version = self
                .feature_schema_version
                .unwrap_or(features.schema.version);
            assert_schema_compatible(version, fingerprint, &features.schema)?;
        }
        Ok(())
    }
}

impl DemandPredictor for LagLinearModel {
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<f64>, PredictorError> {
        self.check_schema(features)?;

        let lag_columns = (1..=self.lag_weights.len())
            .map(|k| {
                let name = lag_column_name(k);
                features
                    .column_index(&name)
                    .ok_or(PredictorError::MissingColumn(name))
            })
            .collect::<Result<Vec<usize>, PredictorError>>()?;

        let width = features.schema.columns.len();
        features
            .values
            .iter()
            .enumerate()
            .map(|(row_idx, row)| {
                if row.len() != width {
                    return Err(PredictorError::RowWidth {
                        row: row_idx,
                        expected: width,
                        found: row.len(),
                    });
                }
                Ok(lag_columns
                    .iter()
                    .zip(&self.lag_weights)
                    .fold(self.intercept, |acc, (col, weight)| acc + weight * row[*col]))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_feature_schema, FeatureRow};

    fn matrix(lags: &[&[i64]], with_target: bool) -> FeatureMatrix {
        let window = lags.first().map(|row| row.len()).unwrap_or(1);
        let rows: Vec<FeatureRow> = lags
            .iter()
            .enumerate()
            .map(|(idx, row)| FeatureRow {
                location_id: format!("L{idx}"),
                target_hour_ts_ms_utc: 0,
                lags: row.to_vec(),
            })
            .collect();
        FeatureMatrix::from_rows(&rows, &build_feature_schema(window, with_target))
            .expect("matrix builds")
    }

    #[test]
    fn rounds_to_nearest_integer() {
        let policy = NegativePredictionPolicy::Surface;
        assert_eq!(finalize_prediction(0, 7.4, policy).unwrap(), 7);
        assert_eq!(finalize_prediction(0, 7.6, policy).unwrap(), 8);
        assert_eq!(finalize_prediction(0, 2.5, policy).unwrap(), 2);
        assert_eq!(finalize_prediction(0, 3.5, policy).unwrap(), 4);
    }

    #[test]
    fn negative_policy_is_the_only_clamp() {
        assert_eq!(
            finalize_prediction(0, -2.6, NegativePredictionPolicy::Surface).unwrap(),
            -3
        );
        assert_eq!(
            finalize_prediction(0, -2.6, NegativePredictionPolicy::ClampToZero).unwrap(),
            0
        );
        assert_eq!(
            finalize_prediction(0, 4.2, NegativePredictionPolicy::ClampToZero).unwrap(),
            4
        );
    }

    #[test]
    fn malformed_estimates_are_errors() {
        let policy = NegativePredictionPolicy::Surface;
        assert!(matches!(
            finalize_prediction(3, f64::NAN, policy),
            Err(PredictorError::NonFinite { row: 3, .. })
        ));
        assert!(matches!(
            finalize_prediction(1, 3.0e10, policy),
            Err(PredictorError::OutOfRange { row: 1, .. })
        ));
        assert!(matches!(
            finalize_predictions(&[1.0], 2, policy),
            Err(PredictorError::OutputLength {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn lag_linear_model_ignores_target_placeholder() {
        let model = LagLinearModel::new(1.0, vec![0.5, 0.25]);
        let features = matrix(&[&[4, 8], &[0, 0]], true);

        let out = model.predict(&features).expect("predict");
        assert_eq!(out, vec![1.0 + 2.0 + 2.0, 1.0]);
    }

    #[test]
    fn lag_linear_model_requires_its_lag_columns() {
        let model = LagLinearModel::new(0.0, vec![1.0, 1.0, 1.0]);
        let features = matrix(&[&[1, 2]], false);

        let err = model.predict(&features).expect_err("lag_3 missing");
        assert!(matches!(err, PredictorError::MissingColumn(name) if name == "lag_3"));
    }

    #[test]
    fn pinned_fingerprint_must_match_matrix_schema() {
        let features = matrix(&[&[1, 2]], true);
        let mut model = LagLinearModel::new(0.0, vec![1.0, 1.0]);
        model.feature_schema_fingerprint = Some(features.schema.fingerprint.clone());
        assert!(model.predict(&features).is_ok());

        model.feature_schema_fingerprint = Some("stale".to_string());
        assert!(matches!(
            model.predict(&features),
            Err(PredictorError::Schema(
                FeatureError::SchemaFingerprintMismatch { .. }
            ))
        ));
    }
}
