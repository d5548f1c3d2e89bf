use std::path::PathBuf;

use ridecast::{
    format_hour, inference_config_from_env, init_logging, log_app_start, log_run_config,
    logging_config_from_env, ModelRegistry, RollingScheduler, SqlitePredictionStore,
    SqliteSeriesStore, TickOutcome,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("rolling_inference", &logging_cfg);

    let cfg = inference_config_from_env()?;
    log_run_config(&cfg);

    let series_path = env_path("RIDECAST_SERIES_STORE_PATH", "data/ridecast/series.sqlite");
    let prediction_path = env_path(
        "RIDECAST_PREDICTION_STORE_PATH",
        "data/ridecast/predictions.sqlite",
    );
    let registry = ModelRegistry::new(env_path(
        "RIDECAST_MODEL_REGISTRY_ROOT",
        "data/ridecast/models",
    ));
    let resume = cfg.resume;

    let source = SqliteSeriesStore::open(&series_path, cfg.feature_view.clone())?;
    let mut sink = SqlitePredictionStore::open(&prediction_path, cfg.prediction_group.clone())?;
    let (artifact, model) = registry.load_lag_linear(&cfg.model)?;

    println!(
        "Rolling inference | model={}@v{} series={} predictions={} resume={}",
        artifact.name,
        artifact.version,
        series_path.display(),
        prediction_path.display(),
        resume
    );

    let mut scheduler = RollingScheduler::new(cfg, &source, &model, &mut sink)?;
    let report = if resume {
        scheduler.resume()?
    } else {
        scheduler.run()?
    };

    for tick in &report.ticks {
        let outcome = match &tick.outcome {
            TickOutcome::Persisted { records } => format!("persisted {records}"),
            TickOutcome::SkippedEmptyWindow => "skipped (empty window)".to_string(),
            TickOutcome::NoFeatureRows { observations } => {
                format!("skipped (no complete window in {observations} observations)")
            }
            TickOutcome::Failed { reason } => format!("failed: {reason}"),
        };
        println!(
            "current={} pickup={} | {}",
            format_hour(tick.current_hour_ts_ms_utc),
            format_hour(tick.pickup_hour_ts_ms_utc),
            outcome
        );
    }

    println!(
        "Done | ticks={} persisted_records={} skipped_ticks={} next_hour={}",
        report.ticks.len(),
        report.persisted_records(),
        report.skipped_ticks(),
        format_hour(report.end_hour_ts_ms_utc)
    );
    Ok(())
}

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}
