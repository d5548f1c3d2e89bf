//! Rolling inference configuration and its environment loader.

use std::env;
use std::fmt;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::predictor::NegativePredictionPolicy;
use crate::series::HOUR_MS;
use crate::sink::{WriteMode, WriteOptions};

pub const DEFAULT_MODEL_NAME: &str = "citi_bike_demand_model";
pub const DEFAULT_FEATURE_VIEW: &str = "time_series_hourly_feature_view";
pub const DEFAULT_PREDICTION_GROUP: &str = "model_prediction";
pub const DEFAULT_WINDOW_SIZE: usize = 24;
pub const DEFAULT_STEP_SIZE: usize = 1;
pub const DEFAULT_TICK_COUNT: u32 = 5;
/// One leap year of hourly lags.
pub const MAX_WINDOW_SIZE: usize = 24 * 366;
/// 2023-12-31T18:00:00Z
pub const DEFAULT_ANCHOR_HOUR_TS_MS_UTC: i64 = 1_704_045_600_000;

/// A name plus integer version, as used for feature views and feature groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedName {
    pub name: String,
    pub version: u32,
}

impl VersionedName {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for VersionedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.name, self.version)
    }
}

/// Model identifier; `version: None` resolves to the latest registered version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub version: Option<u32>,
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(version) => write!(f, "{}@v{version}", self.name),
            None => write!(f, "{}@latest", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickFailurePolicy {
    /// Any predictor, sink or source failure aborts the whole run.
    FailFast,
    /// A failing tick is recorded and the run moves on to the next hour.
    IsolateTick,
}

impl TickFailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::IsolateTick => "isolate_tick",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fail_fast" | "fail-fast" => Some(Self::FailFast),
            "isolate_tick" | "isolate-tick" | "isolate" => Some(Self::IsolateTick),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub model: ModelRef,
    pub feature_view: VersionedName,
    pub prediction_group: VersionedName,
    pub window_size: usize,
    pub step_size: usize,
    pub anchor_hour_ts_ms_utc: i64,
    pub tick_count: u32,
    /// Exclusive upper bound on `current_hour`; stops the run early when reached.
    pub terminal_hour_ts_ms_utc: Option<i64>,
    pub include_target_placeholder: bool,
    pub negative_policy: NegativePredictionPolicy,
    pub failure_policy: TickFailurePolicy,
    pub write_options: WriteOptions,
    /// Skip ticks whose pickup hour the sink already holds.
    pub resume: bool,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model: ModelRef {
                name: DEFAULT_MODEL_NAME.to_string(),
                version: None,
            },
            feature_view: VersionedName::new(DEFAULT_FEATURE_VIEW, 1),
            prediction_group: VersionedName::new(DEFAULT_PREDICTION_GROUP, 1),
            window_size: DEFAULT_WINDOW_SIZE,
            step_size: DEFAULT_STEP_SIZE,
            anchor_hour_ts_ms_utc: DEFAULT_ANCHOR_HOUR_TS_MS_UTC,
            tick_count: DEFAULT_TICK_COUNT,
            terminal_hour_ts_ms_utc: None,
            include_target_placeholder: true,
            negative_policy: NegativePredictionPolicy::Surface,
            failure_policy: TickFailurePolicy::FailFast,
            write_options: WriteOptions::default(),
            resume: false,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::Invalid("model name must not be empty".to_string()));
        }
        if self.feature_view.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "feature view name must not be empty".to_string(),
            ));
        }
        if self.prediction_group.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "prediction group name must not be empty".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be > 0".to_string()));
        }
        if self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "window_size must be <= {MAX_WINDOW_SIZE}, got {}",
                self.window_size
            )));
        }
        if self.step_size == 0 {
            return Err(ConfigError::Invalid("step_size must be > 0".to_string()));
        }
        if self.step_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::Invalid(format!(
                "step_size must be <= {MAX_WINDOW_SIZE}, got {}",
                self.step_size
            )));
        }
        if self.anchor_hour_ts_ms_utc.rem_euclid(HOUR_MS) != 0 {
            return Err(ConfigError::Invalid(
                "anchor hour must be aligned to the hour".to_string(),
            ));
        }
        if let Some(terminal) = self.terminal_hour_ts_ms_utc {
            if terminal.rem_euclid(HOUR_MS) != 0 {
                return Err(ConfigError::Invalid(
                    "terminal hour must be aligned to the hour".to_string(),
                ));
            }
            if terminal <= self.anchor_hour_ts_ms_utc {
                return Err(ConfigError::Invalid(
                    "terminal hour must be after the anchor hour".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Milliseconds between the oldest lag hour and the current hour.
    pub fn window_span_ms(&self) -> i64 {
        i64::try_from(self.window_size)
            .unwrap_or(i64::MAX)
            .saturating_mul(HOUR_MS)
    }

    /// Exclusive end of the `current_hour` range this run covers.
    pub fn end_hour_ts_ms_utc(&self) -> i64 {
        let by_ticks = self
            .anchor_hour_ts_ms_utc
            .saturating_add(i64::from(self.tick_count).saturating_mul(HOUR_MS));
        match self.terminal_hour_ts_ms_utc {
            Some(terminal) => by_ticks.min(terminal),
            None => by_ticks,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid inference config: {0}")]
    Invalid(String),
}

pub fn inference_config_from_env() -> Result<InferenceConfig, ConfigError> {
    inference_config_from_lookup(|key| env::var(key).ok())
}

pub fn inference_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<InferenceConfig, ConfigError> {
    let mut config = InferenceConfig::default();
    let read = |key: &'static str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(name) = read("RIDECAST_MODEL_NAME") {
        config.model.name = name;
    }
    if let Some(raw) = read("RIDECAST_MODEL_VERSION") {
        config.model.version = if raw.eq_ignore_ascii_case("latest") {
            None
        } else {
            Some(parse_number("RIDECAST_MODEL_VERSION", &raw)?)
        };
    }
    if let Some(name) = read("RIDECAST_FEATURE_VIEW") {
        config.feature_view.name = name;
    }
    if let Some(raw) = read("RIDECAST_FEATURE_VIEW_VERSION") {
        config.feature_view.version = parse_number("RIDECAST_FEATURE_VIEW_VERSION", &raw)?;
    }
    if let Some(name) = read("RIDECAST_PREDICTION_GROUP") {
        config.prediction_group.name = name;
    }
    if let Some(raw) = read("RIDECAST_PREDICTION_GROUP_VERSION") {
        config.prediction_group.version =
            parse_number("RIDECAST_PREDICTION_GROUP_VERSION", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_WINDOW_SIZE") {
        config.window_size = parse_number("RIDECAST_WINDOW_SIZE", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_STEP_SIZE") {
        config.step_size = parse_number("RIDECAST_STEP_SIZE", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_ANCHOR_HOUR") {
        config.anchor_hour_ts_ms_utc = parse_hour("RIDECAST_ANCHOR_HOUR", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_TICKS") {
        config.tick_count = parse_number("RIDECAST_TICKS", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_TERMINAL_HOUR") {
        config.terminal_hour_ts_ms_utc = Some(parse_hour("RIDECAST_TERMINAL_HOUR", &raw)?);
    }
    if let Some(raw) = read("RIDECAST_TARGET_PLACEHOLDER") {
        config.include_target_placeholder = parse_flag("RIDECAST_TARGET_PLACEHOLDER", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_NEGATIVE_POLICY") {
        config.negative_policy = NegativePredictionPolicy::parse(&raw)
            .ok_or_else(|| invalid("RIDECAST_NEGATIVE_POLICY", &raw, "expected surface|clamp"))?;
    }
    if let Some(raw) = read("RIDECAST_FAILURE_POLICY") {
        config.failure_policy = TickFailurePolicy::parse(&raw).ok_or_else(|| {
            invalid(
                "RIDECAST_FAILURE_POLICY",
                &raw,
                "expected fail_fast|isolate_tick",
            )
        })?;
    }
    if let Some(raw) = read("RIDECAST_WRITE_MODE") {
        config.write_options.mode = WriteMode::parse(&raw)
            .ok_or_else(|| invalid("RIDECAST_WRITE_MODE", &raw, "expected append|upsert"))?;
    }
    if let Some(raw) = read("RIDECAST_WAIT_FOR_WRITE") {
        config.write_options.wait_for_completion = parse_flag("RIDECAST_WAIT_FOR_WRITE", &raw)?;
    }
    if let Some(raw) = read("RIDECAST_RESUME") {
        config.resume = parse_flag("RIDECAST_RESUME", &raw)?;
    }

    config.validate()?;
    Ok(config)
}

/// Parses an RFC 3339 timestamp, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
pub fn parse_hour_ts_ms_utc(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn parse_hour(var: &'static str, raw: &str) -> Result<i64, ConfigError> {
    let ts = parse_hour_ts_ms_utc(raw)
        .ok_or_else(|| invalid(var, raw, "expected RFC 3339 or 'YYYY-MM-DD HH:MM:SS'"))?;
    if ts.rem_euclid(HOUR_MS) != 0 {
        return Err(invalid(var, raw, "must be aligned to the hour"));
    }
    Ok(ts)
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>()
        .map_err(|_| invalid(var, raw, "expected a non-negative integer"))
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw, "expected a boolean")),
    }
}

fn invalid(var: &'static str, raw: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_run() {
        let cfg = inference_config_from_lookup(|_| None).expect("defaults are valid");
        assert_eq!(cfg, InferenceConfig::default());
        assert_eq!(cfg.window_size, 24);
        assert_eq!(cfg.step_size, 1);
        assert_eq!(cfg.tick_count, 5);
        assert_eq!(
            parse_hour_ts_ms_utc("2023-12-31 18:00:00"),
            Some(cfg.anchor_hour_ts_ms_utc)
        );
        assert_eq!(cfg.write_options.mode, WriteMode::Append);
        assert!(!cfg.write_options.wait_for_completion);
    }

    #[test]
    fn parses_every_recognized_field() {
        let cfg = inference_config_from_lookup(lookup_from(&[
            ("RIDECAST_MODEL_NAME", "xgb"),
            ("RIDECAST_MODEL_VERSION", "3"),
            ("RIDECAST_FEATURE_VIEW", "fv"),
            ("RIDECAST_FEATURE_VIEW_VERSION", "2"),
            ("RIDECAST_PREDICTION_GROUP", "preds"),
            ("RIDECAST_PREDICTION_GROUP_VERSION", "4"),
            ("RIDECAST_WINDOW_SIZE", "12"),
            ("RIDECAST_STEP_SIZE", "2"),
            ("RIDECAST_ANCHOR_HOUR", "2024-01-01T00:00:00Z"),
            ("RIDECAST_TICKS", "48"),
            ("RIDECAST_TERMINAL_HOUR", "2024-01-02T00:00:00+00:00"),
            ("RIDECAST_TARGET_PLACEHOLDER", "false"),
            ("RIDECAST_NEGATIVE_POLICY", "clamp"),
            ("RIDECAST_FAILURE_POLICY", "isolate_tick"),
            ("RIDECAST_WRITE_MODE", "upsert"),
            ("RIDECAST_WAIT_FOR_WRITE", "yes"),
            ("RIDECAST_RESUME", "on"),
        ]))
        .expect("config parses");

        assert_eq!(cfg.model.to_string(), "xgb@v3");
        assert_eq!(cfg.feature_view, VersionedName::new("fv", 2));
        assert_eq!(cfg.prediction_group, VersionedName::new("preds", 4));
        assert_eq!(cfg.window_size, 12);
        assert_eq!(cfg.step_size, 2);
        assert_eq!(cfg.anchor_hour_ts_ms_utc, 1_704_067_200_000);
        assert_eq!(cfg.tick_count, 48);
        assert_eq!(
            cfg.terminal_hour_ts_ms_utc,
            Some(1_704_067_200_000 + 24 * HOUR_MS)
        );
        assert_eq!(cfg.end_hour_ts_ms_utc(), 1_704_067_200_000 + 24 * HOUR_MS);
        assert!(!cfg.include_target_placeholder);
        assert_eq!(cfg.negative_policy, NegativePredictionPolicy::ClampToZero);
        assert_eq!(cfg.failure_policy, TickFailurePolicy::IsolateTick);
        assert_eq!(cfg.write_options.mode, WriteMode::Upsert);
        assert!(cfg.write_options.wait_for_completion);
        assert!(cfg.resume);
    }

    #[test]
    fn latest_model_version_clears_pin() {
        let cfg = inference_config_from_lookup(lookup_from(&[("RIDECAST_MODEL_VERSION", "latest")]))
            .expect("config parses");
        assert_eq!(cfg.model.version, None);
        assert_eq!(cfg.model.to_string(), "citi_bike_demand_model@latest");
    }

    #[test]
    fn malformed_values_are_errors_not_defaults() {
        let err = inference_config_from_lookup(lookup_from(&[("RIDECAST_WINDOW_SIZE", "abc")]))
            .expect_err("window size must be numeric");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "RIDECAST_WINDOW_SIZE",
                ..
            }
        ));

        let err = inference_config_from_lookup(lookup_from(&[(
            "RIDECAST_ANCHOR_HOUR",
            "2024-01-01T00:30:00Z",
        )]))
        .expect_err("anchor must be hour-aligned");
        assert!(err.to_string().contains("aligned"));

        let err = inference_config_from_lookup(lookup_from(&[("RIDECAST_STEP_SIZE", "0")]))
            .expect_err("zero step is invalid");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = inference_config_from_lookup(lookup_from(&[("RIDECAST_RESUME", "maybe")]))
            .expect_err("resume must be a boolean");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "RIDECAST_RESUME",
                ..
            }
        ));
    }

    #[test]
    fn oversized_window_is_rejected() {
        let err = inference_config_from_lookup(lookup_from(&[(
            "RIDECAST_WINDOW_SIZE",
            "100000000000000",
        )]))
        .expect_err("window size must be bounded");
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("window_size"));

        let at_limit = InferenceConfig {
            window_size: MAX_WINDOW_SIZE,
            ..InferenceConfig::default()
        };
        assert!(at_limit.validate().is_ok());
        assert_eq!(at_limit.window_span_ms(), MAX_WINDOW_SIZE as i64 * HOUR_MS);

        let over = InferenceConfig {
            window_size: MAX_WINDOW_SIZE + 1,
            ..InferenceConfig::default()
        };
        assert!(over.validate().is_err());
    }

    #[test]
    fn terminal_hour_before_anchor_is_rejected() {
        let cfg = InferenceConfig {
            terminal_hour_ts_ms_utc: Some(DEFAULT_ANCHOR_HOUR_TS_MS_UTC),
            ..InferenceConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
