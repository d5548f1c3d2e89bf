use std::path::PathBuf;

use ridecast::{
    init_logging, load_trip_observations, log_app_start, logging_config_from_env,
    trip_archive_ref, SqliteSeriesStore, TripIngestConfig, TripSystem, VersionedName,
    DEFAULT_FEATURE_VIEW,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("trip_ingest", &logging_cfg);

    let system = match std::env::var("RIDECAST_TRIP_SYSTEM") {
        Ok(raw) => TripSystem::parse(&raw)
            .ok_or_else(|| format!("RIDECAST_TRIP_SYSTEM must be jc or nyc, got '{raw}'"))?,
        Err(_) => TripSystem::JerseyCity,
    };
    let months = parse_months(
        &std::env::var("RIDECAST_TRIP_MONTHS").unwrap_or_else(|_| "2023-12".to_string()),
    )?;

    let feature_view = VersionedName::new(
        std::env::var("RIDECAST_FEATURE_VIEW").unwrap_or_else(|_| DEFAULT_FEATURE_VIEW.to_string()),
        match std::env::var("RIDECAST_FEATURE_VIEW_VERSION") {
            Ok(raw) => raw.trim().parse()?,
            Err(_) => 1,
        },
    );
    let store_path = std::env::var("RIDECAST_SERIES_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/ridecast/series.sqlite"));

    let cfg = TripIngestConfig {
        data_root: std::env::var("RIDECAST_TRIP_DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/tripdata")),
        ..TripIngestConfig::default()
    };

    let mut store = SqliteSeriesStore::open(&store_path, feature_view)?;
    println!(
        "Trip ingest start | system={:?} months={} store={} data_root={}",
        system,
        months.len(),
        store_path.display(),
        cfg.data_root.display()
    );

    for (year, month) in months {
        let archive = trip_archive_ref(system, year, month)?;
        let (observations, report) = load_trip_observations(&archive, &cfg)?;
        let written = store.upsert_observations(&observations)?;
        println!(
            "{year:04}-{month:02} | rows_read={} rows_skipped={} hourly_rows={} first_error={}",
            report.rows_read,
            report.rows_skipped,
            written,
            report.first_error.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// `YYYY-MM[,YYYY-MM...]`
fn parse_months(raw: &str) -> Result<Vec<(i32, u32)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (year, month) = part
                .split_once('-')
                .ok_or_else(|| format!("expected YYYY-MM, got '{part}'"))?;
            let year = year
                .parse::<i32>()
                .map_err(|_| format!("invalid year in '{part}'"))?;
            let month = month
                .parse::<u32>()
                .map_err(|_| format!("invalid month in '{part}'"))?;
            Ok((year, month))
        })
        .collect()
}
