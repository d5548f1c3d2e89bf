//! Hourly bike-share demand: lag-window features and rolling inference.
//!
//! - `series`: per-location hourly ride counts and their sources
//! - `features`: sliding-window lag feature builder
//! - `scheduler`: rolling multi-step inference over a predictor and a sink
//! - `trips`: Citi Bike trip archive ingestion
//! - `api`: read-only JSON access to persisted predictions

mod api;
mod config;
mod features;
mod observability;
mod predictor;
mod registry;
mod scheduler;
mod series;
mod sink;
mod trips;

pub use api::{
    parse_predictions_params, predictions_router, PredictionReader, PredictionRow,
    PredictionsParams, PredictionsResponse,
};
pub use config::{
    inference_config_from_env, inference_config_from_lookup, parse_hour_ts_ms_utc, ConfigError,
    InferenceConfig, ModelRef, TickFailurePolicy, VersionedName, DEFAULT_ANCHOR_HOUR_TS_MS_UTC,
    DEFAULT_FEATURE_VIEW, DEFAULT_MODEL_NAME, DEFAULT_PREDICTION_GROUP, DEFAULT_STEP_SIZE,
    DEFAULT_TICK_COUNT, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, build_window_features,
    build_window_features_with_report, lag_column_name, FeatureBuildReport, FeatureColumn,
    FeatureDType, FeatureError, FeatureMatrix, FeatureRow, FeatureSchema, FEATURE_SCHEMA_VERSION,
    TARGET_PLACEHOLDER_COLUMN,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_run_config, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use predictor::{
    finalize_prediction, finalize_predictions, DemandPredictor, LagLinearModel,
    NegativePredictionPolicy, PredictorError,
};
pub use registry::{
    ModelArtifact, ModelRegistry, ModelRegistryError, MODEL_ARTIFACT_FILE, MODEL_CHECKSUM_SUFFIX,
};
pub use scheduler::{
    plan_resume, InferenceError, ResumePlan, RollingScheduler, RunReport, TickOutcome, TickReport,
};
pub use series::{
    canonical_location_id, floor_to_hour_ms, format_hour, InMemorySeriesSource, Observation,
    SourceError, SqliteSeriesStore, TimeSeriesSource, HOUR_MS,
};
pub use sink::{
    InMemoryPredictionSink, PredictionQuery, PredictionRecord, PredictionSink, SinkError,
    SqlitePredictionReader, SqlitePredictionStore, StoredPrediction, WriteMode, WriteOptions,
};
pub use trips::{
    aggregate_hourly, load_trip_observations, parse_trip_archive, parse_trip_csv,
    sync_trip_archive, trip_archive_ref, LocalArchiveSource, LocalTripArchive, TripArchiveRef,
    TripIngestConfig, TripIngestError, TripParseReport, TripRecord, TripSystem,
};
