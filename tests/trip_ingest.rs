use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::TimeZone;
use ridecast::{
    aggregate_hourly, load_trip_observations, parse_trip_archive, trip_archive_ref,
    SqliteSeriesStore, TimeSeriesSource, TripIngestConfig, TripSystem, VersionedName, HOUR_MS,
};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;

fn ts_ms(year: i32, month: u32, day: u32, hour: u32) -> i64 {
    chrono::Utc
        .with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid UTC timestamp expected")
        .timestamp_millis()
}

fn write_zip(path: &Path, csv_body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("parent directory should be creatable");
    }

    let file = fs::File::create(path).expect("zip file should be created");
    let mut zip = zip::ZipWriter::new(file);
    zip.start_file("JC-202311-citibike-tripdata.csv", SimpleFileOptions::default())
        .expect("zip entry should be created");
    zip.write_all(csv_body.as_bytes())
        .expect("zip data should be written");
    zip.finish().expect("zip should finalize");
}

// Crosses the 2023-11-05 fall-back transition in New York (01:00 EDT -> 01:00 EST).
const NOVEMBER_CSV: &str = "ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id\n\
a,classic_bike,2023-11-04 23:10:00,2023-11-04 23:20:00,Grove St PATH,JC005,City Hall,JC003\n\
b,classic_bike,2023-11-04 23:50:00,2023-11-05 00:05:00,Grove St PATH,JC005,City Hall,JC003\n\
c,electric_bike,2023-11-05 02:15:00,2023-11-05 02:25:00,Grove St PATH,JC005,City Hall,JC003\n\
d,electric_bike,2023-11-05 00:30:00,2023-11-05 00:45:00,City Hall,JC003,Grove St PATH,JC005\n\
e,classic_bike,not-a-time,2023-11-05 00:45:00,City Hall,JC003,Grove St PATH,JC005\n";

#[test]
fn cached_archive_feeds_the_series_store() {
    let temp = tempdir().expect("temp dir");
    let cfg = TripIngestConfig {
        data_root: temp.path().join("tripdata"),
        max_retries: 0,
        ..TripIngestConfig::default()
    };
    let archive = trip_archive_ref(TripSystem::JerseyCity, 2023, 11).expect("archive ref");
    write_zip(&cfg.data_root.join(&archive.relative_path), NOVEMBER_CSV);

    let (observations, report) = load_trip_observations(&archive, &cfg).expect("load trips");
    assert_eq!(report.rows_read, 5);
    assert_eq!(report.rows_skipped, 1);

    // 23:xx EDT on Nov 4 is 03:xx UTC on Nov 5; 02:15 EST is 07:15 UTC.
    let jc005: Vec<(i64, u32)> = observations
        .iter()
        .filter(|obs| obs.location_id == "JC005")
        .map(|obs| (obs.hour_ts_ms_utc, obs.ride_count))
        .collect();
    assert_eq!(jc005.first(), Some(&(ts_ms(2023, 11, 5, 3), 2)));
    assert_eq!(jc005.last(), Some(&(ts_ms(2023, 11, 5, 7), 1)));
    assert_eq!(jc005.len(), 5);
    assert!(jc005[1..4].iter().all(|(_, count)| *count == 0));

    let mut store = SqliteSeriesStore::open(
        &temp.path().join("series.sqlite"),
        VersionedName::new("time_series_hourly_feature_view", 1),
    )
    .expect("open series store");
    store
        .upsert_observations(&observations)
        .expect("upsert observations");
    // Re-ingesting the same month is idempotent.
    store
        .upsert_observations(&observations)
        .expect("upsert observations again");

    let window = store
        .get_batch_data(ts_ms(2023, 11, 5, 3), ts_ms(2023, 11, 5, 7))
        .expect("read window");
    assert_eq!(window.len(), observations.len());
    assert_eq!(
        store
            .count_range(ts_ms(2023, 11, 5, 0), ts_ms(2023, 11, 6, 0))
            .expect("count"),
        observations.len() as u64
    );
}

#[test]
fn parsed_archive_can_be_aggregated_without_gap_filling() {
    let temp = tempdir().expect("temp dir");
    let path = temp.path().join("month.zip");
    write_zip(&path, NOVEMBER_CSV);

    let (trips, _) = parse_trip_archive(&path, chrono_tz::America::New_York).expect("parse");
    let sparse = aggregate_hourly(&trips, false);

    assert_eq!(sparse.len(), 3);
    assert!(sparse
        .windows(2)
        .all(|pair| pair[0].location_id != pair[1].location_id
            || pair[1].hour_ts_ms_utc - pair[0].hour_ts_ms_utc >= HOUR_MS));
}
