//! Citi Bike trip archives to hourly pickup observations.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::series::{canonical_location_id, floor_to_hour_ms, Observation, HOUR_MS};

const TRIPDATA_BASE_URL: &str = "https://s3.amazonaws.com/tripdata";

const STARTED_AT_HEADERS: [&str; 3] = ["started_at", "starttime", "start time"];
const START_STATION_HEADERS: [&str; 2] = ["start_station_id", "start station id"];
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TripSystem {
    JerseyCity,
    NewYork,
}

impl TripSystem {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "jc" | "jersey_city" | "jersey-city" => Some(Self::JerseyCity),
            "nyc" | "new_york" | "new-york" => Some(Self::NewYork),
            _ => None,
        }
    }

    fn file_prefix(self) -> &'static str {
        match self {
            Self::JerseyCity => "JC-",
            Self::NewYork => "",
        }
    }

    fn dir_name(self) -> &'static str {
        match self {
            Self::JerseyCity => "jc",
            Self::NewYork => "nyc",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripArchiveRef {
    pub system: TripSystem,
    pub year: i32,
    pub month: u32,
    pub url: String,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalArchiveSource {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTripArchive {
    pub archive: TripArchiveRef,
    pub local_path: PathBuf,
    pub source: LocalArchiveSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripRecord {
    pub station_id: String,
    pub started_at_ts_ms_utc: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripParseReport {
    pub rows_read: u64,
    pub rows_skipped: u64,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripIngestConfig {
    pub data_root: PathBuf,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Zone the archive's local timestamps are recorded in.
    pub source_timezone: Tz,
    pub fill_missing_hours: bool,
}

impl Default for TripIngestConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/tripdata"),
            http_timeout_ms: 60_000,
            max_retries: 2,
            retry_backoff_ms: 500,
            source_timezone: chrono_tz::America::New_York,
            fill_missing_hours: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum TripIngestError {
    #[error("invalid archive month {year}-{month:02}")]
    InvalidMonth { year: i32, month: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("trip CSV is missing a {column} column (headers: {headers:?})")]
    MissingColumn {
        column: &'static str,
        headers: Vec<String>,
    },
}

pub fn trip_archive_ref(
    system: TripSystem,
    year: i32,
    month: u32,
) -> Result<TripArchiveRef, TripIngestError> {
    if !(1..=12).contains(&month) || !(2013..=9999).contains(&year) {
        return Err(TripIngestError::InvalidMonth { year, month });
    }

    let filename = format!(
        "{}{year:04}{month:02}-citibike-tripdata.csv.zip",
        system.file_prefix()
    );
    Ok(TripArchiveRef {
        system,
        year,
        month,
        url: format!("{TRIPDATA_BASE_URL}/{filename}"),
        relative_path: PathBuf::from(system.dir_name()).join(filename),
    })
}

pub fn sync_trip_archive(
    archive: &TripArchiveRef,
    cfg: &TripIngestConfig,
) -> Result<LocalTripArchive, TripIngestError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    sync_trip_archive_with_fetcher(archive, cfg, &fetcher)
}

/// Sync, parse and aggregate one monthly archive.
pub fn load_trip_observations(
    archive: &TripArchiveRef,
    cfg: &TripIngestConfig,
) -> Result<(Vec<Observation>, TripParseReport), TripIngestError> {
    let local = sync_trip_archive(archive, cfg)?;
    let (trips, report) = parse_trip_archive(&local.local_path, cfg.source_timezone)?;
    let observations = aggregate_hourly(&trips, cfg.fill_missing_hours);

    info!(
        component = "trips",
        event = "trips.load.finish",
        url = %archive.url,
        rows_read = report.rows_read,
        rows_skipped = report.rows_skipped,
        observations = observations.len()
    );

    Ok((observations, report))
}

pub fn parse_trip_archive(
    path: &Path,
    tz: Tz,
) -> Result<(Vec<TripRecord>, TripParseReport), TripIngestError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    let mut csv_buf = None;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_ascii_lowercase();
        if !name.ends_with(".csv") || name.starts_with("__macosx/") {
            continue;
        }

        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        csv_buf = Some(buf);
        break;
    }
    let csv_buf = csv_buf.ok_or_else(|| TripIngestError::MissingCsvEntry {
        path: path.to_path_buf(),
    })?;

    parse_trip_csv(Cursor::new(csv_buf), tz)
}

/// Reads a trip CSV with either the legacy or the current header layout.
///
/// Rows with an empty station, an unparseable timestamp or a local time that
/// does not exist in `tz` are skipped and counted.
pub fn parse_trip_csv<R: Read>(
    reader: R,
    tz: Tz,
) -> Result<(Vec<TripRecord>, TripParseReport), TripIngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = reader.headers()?.clone();
    let started_idx = header_index(&headers, &STARTED_AT_HEADERS, "started_at")?;
    let station_idx = header_index(&headers, &START_STATION_HEADERS, "start_station_id")?;

    let mut report = TripParseReport::default();
    let mut trips = Vec::new();
    for record in reader.records() {
        let record = record?;
        report.rows_read += 1;
        match parse_trip_record(&record, started_idx, station_idx, tz) {
            Ok(trip) => trips.push(trip),
            Err(reason) => {
                report.rows_skipped += 1;
                debug!(
                    component = "trips",
                    event = "trips.parse.row_skipped",
                    line = report.rows_read,
                    reason = %reason
                );
                if report.first_error.is_none() {
                    report.first_error = Some(format!("row {}: {reason}", report.rows_read));
                }
            }
        }
    }

    if report.rows_skipped > 0 {
        warn!(
            component = "trips",
            event = "trips.parse.rows_skipped",
            rows_read = report.rows_read,
            rows_skipped = report.rows_skipped
        );
    }

    Ok((trips, report))
}

/// Counts pickups per `(station, UTC hour)`.
///
/// With `fill_missing_hours`, every hour between a station's first and last
/// pickup is present, with zero for hours without trips.
pub fn aggregate_hourly(trips: &[TripRecord], fill_missing_hours: bool) -> Vec<Observation> {
    let mut counts: BTreeMap<(String, i64), u32> = BTreeMap::new();
    for trip in trips {
        let key = (
            trip.station_id.clone(),
            floor_to_hour_ms(trip.started_at_ts_ms_utc),
        );
        let slot = counts.entry(key).or_insert(0);
        *slot = slot.saturating_add(1);
    }

    let mut out = Vec::with_capacity(counts.len());
    let mut previous: Option<(String, i64)> = None;
    for ((station_id, hour), count) in counts {
        if fill_missing_hours {
            if let Some((prev_station, prev_hour)) = &previous {
                if *prev_station == station_id {
                    let mut gap_hour = prev_hour + HOUR_MS;
                    while gap_hour < hour {
                        out.push(Observation::new(station_id.clone(), gap_hour, 0));
                        gap_hour += HOUR_MS;
                    }
                }
            }
            previous = Some((station_id.clone(), hour));
        }
        out.push(Observation::new(station_id, hour, count));
    }
    out
}

fn header_index(
    headers: &StringRecord,
    candidates: &[&str],
    column: &'static str,
) -> Result<usize, TripIngestError> {
    headers
        .iter()
        .position(|header| {
            let normalized = header.trim().trim_matches('"').to_ascii_lowercase();
            candidates.contains(&normalized.as_str())
        })
        .ok_or_else(|| TripIngestError::MissingColumn {
            column,
            headers: headers.iter().map(str::to_string).collect(),
        })
}

fn parse_trip_record(
    record: &StringRecord,
    started_idx: usize,
    station_idx: usize,
    tz: Tz,
) -> Result<TripRecord, String> {
    let station_raw = record.get(station_idx).unwrap_or_default();
    let station_id = canonical_location_id(station_raw);
    if station_id.is_empty() {
        return Err("empty start station id".to_string());
    }

    let started_raw = record.get(started_idx).unwrap_or_default().trim();
    let naive = parse_local_timestamp(started_raw)
        .ok_or_else(|| format!("unparseable start time '{started_raw}'"))?;
    let started = tz
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("start time '{started_raw}' does not exist in {tz}"))?;

    Ok(TripRecord {
        station_id,
        started_at_ts_ms_utc: started.timestamp_millis(),
    })
}

fn parse_local_timestamp(raw: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

fn sync_trip_archive_with_fetcher(
    archive: &TripArchiveRef,
    cfg: &TripIngestConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<LocalTripArchive, TripIngestError> {
    let local_path = cfg.data_root.join(&archive.relative_path);
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if local_path.exists() {
        info!(
            component = "trips",
            event = "trips.sync.file.cached",
            path = %local_path.display()
        );
        return Ok(LocalTripArchive {
            archive: archive.clone(),
            local_path,
            source: LocalArchiveSource::Cached,
        });
    }

    let bytes = retry(cfg, || fetcher.get_bytes(&archive.url))?;
    write_atomic(&local_path, &bytes)?;

    info!(
        component = "trips",
        event = "trips.sync.file.downloaded",
        path = %local_path.display(),
        bytes = bytes.len()
    );
    debug!(
        component = "trips",
        event = "trips.sync.file.downloaded.debug",
        url = %archive.url
    );

    Ok(LocalTripArchive {
        archive: archive.clone(),
        local_path,
        source: LocalArchiveSource::Downloaded,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TripIngestError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripIngestError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, TripIngestError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| TripIngestError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripIngestError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TripIngestError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TripIngestError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| TripIngestError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

fn retry<T>(
    cfg: &TripIngestConfig,
    mut f: impl FnMut() -> Result<T, TripIngestError>,
) -> Result<T, TripIngestError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                warn!(
                    component = "trips",
                    event = "trips.sync.retry",
                    attempt,
                    sleep_ms,
                    error = %err
                );
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}
