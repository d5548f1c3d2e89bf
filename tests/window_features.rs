use chrono::TimeZone;
use ridecast::{
    build_feature_schema, build_window_features, build_window_features_with_report,
    FeatureError, FeatureMatrix, Observation, HOUR_MS,
};

fn ts_ms(year: i32, month: u32, day: u32, hour: u32) -> i64 {
    chrono::Utc
        .with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid UTC timestamp expected")
        .timestamp_millis()
}

fn hourly(location: &str, start: i64, counts: &[u32]) -> Vec<Observation> {
    counts
        .iter()
        .enumerate()
        .map(|(idx, count)| Observation::new(location, start + idx as i64 * HOUR_MS, *count))
        .collect()
}

#[test]
fn exactly_window_plus_one_hours_yield_one_row() {
    let start = ts_ms(2024, 1, 1, 0);
    let counts: Vec<u32> = (0..=24).collect();
    let rows = build_window_features(&hourly("A", start, &counts), 24, 1).expect("build succeeds");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].location_id, "A");
    assert_eq!(rows[0].target_hour_ts_ms_utc, start + 24 * HOUR_MS);
    assert_eq!(rows[0].lag(1), Some(23));
    assert_eq!(rows[0].lag(24), Some(0));
}

#[test]
fn fewer_than_window_plus_one_hours_yield_nothing() {
    let start = ts_ms(2024, 1, 1, 0);
    let counts: Vec<u32> = (0..24).collect();
    let rows = build_window_features(&hourly("A", start, &counts), 24, 1).expect("build succeeds");
    assert!(rows.is_empty());
}

#[test]
fn day_of_history_produces_lags_in_reverse_hour_order() {
    // 24 observed lag hours 00:00..23:00 with values 1..=24, plus the target hour.
    let start = ts_ms(2024, 1, 1, 0);
    let mut counts: Vec<u32> = (1..=24).collect();
    counts.push(0);
    let rows = build_window_features(&hourly("7", start, &counts), 24, 1).expect("build succeeds");

    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.target_hour_ts_ms_utc, ts_ms(2024, 1, 2, 0));
    assert_eq!(row.lag(1), Some(24));
    assert_eq!(row.lag(24), Some(1));
    let expected: Vec<i64> = (1..=24).rev().collect();
    assert_eq!(row.lags, expected);
}

#[test]
fn full_day_of_constant_demand_yields_one_row_at_midnight() {
    let start = ts_ms(2024, 1, 1, 0);
    let obs = hourly("A", start, &[5; 25]);
    let rows = build_window_features(&obs, 24, 1).expect("build succeeds");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].target_hour_ts_ms_utc, ts_ms(2024, 1, 2, 0));
    assert!(rows[0].lags.iter().all(|lag| *lag == 5));
    assert_eq!(rows[0].lags.len(), 24);
}

#[test]
fn input_order_does_not_change_output() {
    let start = ts_ms(2024, 3, 10, 0);
    let mut sorted = hourly("A", start, &[1, 2, 3, 4, 5, 6]);
    sorted.extend(hourly("B", start, &[9, 8, 7, 6, 5, 4]));

    let mut shuffled = sorted.clone();
    shuffled.reverse();
    shuffled.swap(1, 7);
    shuffled.swap(0, 4);

    let a = build_window_features(&sorted, 3, 1).expect("sorted build");
    let b = build_window_features(&shuffled, 3, 1).expect("shuffled build");
    assert_eq!(a, b);
    assert_eq!(a.len(), 6);
    assert!(a[..3].iter().all(|row| row.location_id == "A"));
    assert!(a[3..].iter().all(|row| row.location_id == "B"));
}

#[test]
fn missing_hour_disqualifies_every_window_covering_it() {
    let start = ts_ms(2024, 1, 1, 0);
    let mut obs = hourly("A", start, &[1, 2, 3, 4, 5, 6, 7, 8]);
    obs.remove(3);

    let (rows, report) = build_window_features_with_report(&obs, 2, 1).expect("build succeeds");
    let targets: Vec<i64> = rows.iter().map(|row| row.target_hour_ts_ms_utc).collect();

    // Hour 3 is missing: windows targeting hours 3, 4 and 5 all need it.
    assert_eq!(
        targets,
        vec![start + 2 * HOUR_MS, start + 6 * HOUR_MS, start + 7 * HOUR_MS]
    );
    assert_eq!(report.gap_windows, 3);
    assert_eq!(report.output_rows, 3);
}

#[test]
fn locations_are_windowed_independently() {
    let start = ts_ms(2024, 1, 1, 0);
    let mut obs = hourly("A", start, &[1, 1, 1]);
    obs.extend(hourly("B", start, &[5, 5]));

    let (rows, report) = build_window_features_with_report(&obs, 2, 1).expect("build succeeds");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].location_id, "A");
    assert_eq!(report.locations, 2);
    assert_eq!(report.skipped_locations, 1);
}

#[test]
fn step_size_spaces_window_starts() {
    let start = ts_ms(2024, 1, 1, 0);
    let counts: Vec<u32> = (0..10).collect();
    let rows = build_window_features(&hourly("A", start, &counts), 2, 3).expect("build succeeds");
    let targets: Vec<i64> = rows
        .iter()
        .map(|row| (row.target_hour_ts_ms_utc - start) / HOUR_MS)
        .collect();
    assert_eq!(targets, vec![2, 5, 8]);
}

#[test]
fn invalid_window_configuration_is_an_error() {
    let obs = hourly("A", ts_ms(2024, 1, 1, 0), &[1, 2, 3]);
    assert!(matches!(
        build_window_features(&obs, 0, 1),
        Err(FeatureError::InvalidConfig(_))
    ));
    assert!(matches!(
        build_window_features(&obs, 2, 0),
        Err(FeatureError::InvalidConfig(_))
    ));
}

#[test]
fn matrix_follows_schema_column_order() {
    let start = ts_ms(2024, 1, 1, 0);
    let rows = build_window_features(&hourly("A", start, &[3, 2, 1]), 2, 1).expect("build");
    let schema = build_feature_schema(2, true);
    let matrix = FeatureMatrix::from_rows(&rows, &schema).expect("matrix");

    assert_eq!(matrix.column_index("lag_1"), Some(0));
    assert_eq!(matrix.column_index("lag_2"), Some(1));
    assert_eq!(matrix.column_index("target"), Some(2));
    assert_eq!(matrix.values, vec![vec![2.0, 3.0, 0.0]]);
    assert_eq!(matrix.target_hours_ts_ms_utc, vec![start + 2 * HOUR_MS]);
}
