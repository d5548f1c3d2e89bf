//! Rolling hour-by-hour inference.
//!
//! Each tick fetches `[current - W, current]`, builds lag features, scores
//! them and persists one record per location for `current + 1h`, then
//! advances `current` by one hour whatever the tick outcome was.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, InferenceConfig, TickFailurePolicy};
use crate::features::{
    build_feature_schema, build_window_features, FeatureError, FeatureMatrix, FeatureSchema,
};
use crate::predictor::{finalize_predictions, DemandPredictor, PredictorError};
use crate::series::{canonical_location_id, format_hour, SourceError, TimeSeriesSource, HOUR_MS};
use crate::sink::{PredictionRecord, PredictionSink, SinkError};

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid inference config: {0}")]
    Config(#[from] ConfigError),
    #[error("feature build failed: {0}")]
    Features(#[from] FeatureError),
    #[error("source fetch failed at {}: {source}", hour_label(.current_hour_ts_ms_utc))]
    Source {
        current_hour_ts_ms_utc: i64,
        #[source]
        source: SourceError,
    },
    #[error(
        "predictor failed at {} for {locations} locations: {source}",
        hour_label(.current_hour_ts_ms_utc)
    )]
    Predictor {
        current_hour_ts_ms_utc: i64,
        locations: usize,
        #[source]
        source: PredictorError,
    },
    #[error(
        "prediction write failed at {} for {locations} locations: {source}",
        hour_label(.current_hour_ts_ms_utc)
    )]
    Sink {
        current_hour_ts_ms_utc: i64,
        locations: usize,
        #[source]
        source: SinkError,
    },
}

impl InferenceError {
    pub fn current_hour_ts_ms_utc(&self) -> Option<i64> {
        match self {
            Self::Source {
                current_hour_ts_ms_utc,
                ..
            }
            | Self::Predictor {
                current_hour_ts_ms_utc,
                ..
            }
            | Self::Sink {
                current_hour_ts_ms_utc,
                ..
            } => Some(*current_hour_ts_ms_utc),
            Self::Config(_) | Self::Features(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    Persisted { records: usize },
    SkippedEmptyWindow,
    NoFeatureRows { observations: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub current_hour_ts_ms_utc: i64,
    pub pickup_hour_ts_ms_utc: i64,
    pub locations: usize,
    pub outcome: TickOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub start_hour_ts_ms_utc: i64,
    /// Value of the cursor after the last tick.
    pub end_hour_ts_ms_utc: i64,
    pub ticks: Vec<TickReport>,
}

impl RunReport {
    pub fn persisted_records(&self) -> usize {
        self.ticks
            .iter()
            .map(|tick| match tick.outcome {
                TickOutcome::Persisted { records } => records,
                _ => 0,
            })
            .sum()
    }

    pub fn skipped_ticks(&self) -> usize {
        self.ticks
            .iter()
            .filter(|tick| !matches!(tick.outcome, TickOutcome::Persisted { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePlan {
    pub start_hour_ts_ms_utc: i64,
    pub tick_count: u32,
}

/// Where a rerun should pick up given the newest pickup hour already stored.
///
/// Tick `current` persists pickup hour `current + 1h`, so a stored pickup hour
/// `p` means every tick before `current = p` is done.
pub fn plan_resume(config: &InferenceConfig, latest_pickup_hour: Option<i64>) -> ResumePlan {
    let anchor = config.anchor_hour_ts_ms_utc;
    let end = config.end_hour_ts_ms_utc();
    let start = match latest_pickup_hour {
        Some(pickup) if pickup > anchor => pickup.min(end),
        _ => anchor,
    };

    ResumePlan {
        start_hour_ts_ms_utc: start,
        tick_count: ticks_between(start, end),
    }
}

fn ticks_between(start: i64, end: i64) -> u32 {
    let hours = end.saturating_sub(start).max(0) / HOUR_MS;
    u32::try_from(hours).unwrap_or(u32::MAX)
}

pub struct RollingScheduler<'a> {
    config: InferenceConfig,
    schema: FeatureSchema,
    source: &'a dyn TimeSeriesSource,
    predictor: &'a dyn DemandPredictor,
    sink: &'a mut dyn PredictionSink,
}

impl<'a> RollingScheduler<'a> {
    pub fn new(
        config: InferenceConfig,
        source: &'a dyn TimeSeriesSource,
        predictor: &'a dyn DemandPredictor,
        sink: &'a mut dyn PredictionSink,
    ) -> Result<Self, InferenceError> {
        config.validate()?;
        let schema = build_feature_schema(config.window_size, config.include_target_placeholder);
        Ok(Self {
            config,
            schema,
            source,
            predictor,
            sink,
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Runs every configured tick from the anchor hour.
    pub fn run(&mut self) -> Result<RunReport, InferenceError> {
        let anchor = self.config.anchor_hour_ts_ms_utc;
        let plan = ResumePlan {
            start_hour_ts_ms_utc: anchor,
            tick_count: ticks_between(anchor, self.config.end_hour_ts_ms_utc()),
        };
        self.run_plan(plan)
    }

    /// Runs only the ticks whose predictions the sink does not hold yet.
    ///
    /// Only pickup hours this run would produce count as already done.
    pub fn resume(&mut self) -> Result<RunReport, InferenceError> {
        let first_pickup = self.config.anchor_hour_ts_ms_utc + HOUR_MS;
        let last_pickup = self.config.end_hour_ts_ms_utc();
        let latest = self
            .sink
            .latest_pickup_hour(first_pickup, last_pickup)
            .map_err(|source| InferenceError::Sink {
                current_hour_ts_ms_utc: self.config.anchor_hour_ts_ms_utc,
                locations: 0,
                source,
            })?;
        let plan = plan_resume(&self.config, latest);

        info!(
            component = "inference",
            event = "inference.run.resume",
            latest_pickup_hour = ?latest.map(format_hour),
            start_hour = %format_hour(plan.start_hour_ts_ms_utc),
            ticks = plan.tick_count
        );

        self.run_plan(plan)
    }

    pub fn run_plan(&mut self, plan: ResumePlan) -> Result<RunReport, InferenceError> {
        let mut current = plan.start_hour_ts_ms_utc;
        let mut ticks = Vec::new();

        info!(
            component = "inference",
            event = "inference.run.start",
            model = %self.config.model,
            feature_view = %self.config.feature_view,
            prediction_group = %self.config.prediction_group,
            start_hour = %format_hour(current),
            ticks = plan.tick_count,
            window_size = self.config.window_size,
            step_size = self.config.step_size,
            failure_policy = self.config.failure_policy.as_str(),
            write_mode = self.config.write_options.mode.as_str()
        );

        for _ in 0..plan.tick_count {
            if let Some(terminal) = self.config.terminal_hour_ts_ms_utc {
                if current >= terminal {
                    break;
                }
            }

            let report = match self.tick(current) {
                Ok(report) => report,
                Err(err) => match self.config.failure_policy {
                    TickFailurePolicy::FailFast => {
                        error!(
                            component = "inference",
                            event = "inference.run.aborted",
                            current_hour = %format_hour(current),
                            completed_ticks = ticks.len(),
                            error = %err
                        );
                        return Err(err);
                    }
                    TickFailurePolicy::IsolateTick => {
                        warn!(
                            component = "inference",
                            event = "inference.tick.failed",
                            current_hour = %format_hour(current),
                            error = %err
                        );
                        TickReport {
                            current_hour_ts_ms_utc: current,
                            pickup_hour_ts_ms_utc: current + HOUR_MS,
                            locations: failed_locations(&err),
                            outcome: TickOutcome::Failed {
                                reason: err.to_string(),
                            },
                        }
                    }
                },
            };
            ticks.push(report);

            current += HOUR_MS;
        }

        let report = RunReport {
            start_hour_ts_ms_utc: plan.start_hour_ts_ms_utc,
            end_hour_ts_ms_utc: current,
            ticks,
        };

        info!(
            component = "inference",
            event = "inference.run.finish",
            end_hour = %format_hour(current),
            ticks = report.ticks.len(),
            persisted_records = report.persisted_records(),
            skipped_ticks = report.skipped_ticks()
        );

        Ok(report)
    }

    fn tick(&mut self, current: i64) -> Result<TickReport, InferenceError> {
        let pickup = current + HOUR_MS;
        let window_start = current - self.config.window_span_ms();

        let observations = self
            .source
            .get_batch_data(window_start, current)
            .map_err(|source| InferenceError::Source {
                current_hour_ts_ms_utc: current,
                source,
            })?;

        if observations.is_empty() {
            warn!(
                component = "inference",
                event = "inference.tick.empty_window",
                current_hour = %format_hour(current),
                window_start = %format_hour(window_start)
            );
            return Ok(TickReport {
                current_hour_ts_ms_utc: current,
                pickup_hour_ts_ms_utc: pickup,
                locations: 0,
                outcome: TickOutcome::SkippedEmptyWindow,
            });
        }

        let rows = build_window_features(
            &observations,
            self.config.window_size,
            self.config.step_size,
        )?;
        if rows.is_empty() {
            warn!(
                component = "inference",
                event = "inference.tick.no_feature_rows",
                current_hour = %format_hour(current),
                observations = observations.len()
            );
            return Ok(TickReport {
                current_hour_ts_ms_utc: current,
                pickup_hour_ts_ms_utc: pickup,
                locations: 0,
                outcome: TickOutcome::NoFeatureRows {
                    observations: observations.len(),
                },
            });
        }

        let locations = rows.len();
        let matrix = FeatureMatrix::from_rows(&rows, &self.schema)?;
        let predicted = self
            .predictor
            .predict(&matrix)
            .and_then(|raw| finalize_predictions(&raw, locations, self.config.negative_policy))
            .map_err(|source| InferenceError::Predictor {
                current_hour_ts_ms_utc: current,
                locations,
                source,
            })?;

        let records: Vec<PredictionRecord> = rows
            .iter()
            .zip(predicted)
            .map(|(row, predicted_rides)| PredictionRecord {
                pickup_location_id: canonical_location_id(&row.location_id),
                pickup_hour_ts_ms_utc: pickup,
                predicted_rides,
            })
            .collect();

        self.sink
            .insert(&records, &self.config.write_options)
            .map_err(|source| InferenceError::Sink {
                current_hour_ts_ms_utc: current,
                locations,
                source,
            })?;

        info!(
            component = "inference",
            event = "inference.tick.persisted",
            current_hour = %format_hour(current),
            pickup_hour = %format_hour(pickup),
            records = records.len()
        );

        Ok(TickReport {
            current_hour_ts_ms_utc: current,
            pickup_hour_ts_ms_utc: pickup,
            locations,
            outcome: TickOutcome::Persisted {
                records: records.len(),
            },
        })
    }
}

fn hour_label(ts_ms_utc: &i64) -> String {
    format_hour(*ts_ms_utc)
}

fn failed_locations(err: &InferenceError) -> usize {
    match err {
        InferenceError::Predictor { locations, .. } | InferenceError::Sink { locations, .. } => {
            *locations
        }
        _ => 0,
    }
}
