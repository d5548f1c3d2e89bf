//! Read-only JSON routes over persisted predictions.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::parse_hour_ts_ms_utc;
use crate::series::{canonical_location_id, format_hour};
use crate::sink::{PredictionQuery, SinkError, SqlitePredictionReader, StoredPrediction};

pub trait PredictionReader: Send + Sync + 'static {
    fn read(&self, query: &PredictionQuery) -> Result<Vec<StoredPrediction>, SinkError>;
}

impl PredictionReader for SqlitePredictionReader {
    fn read(&self, query: &PredictionQuery) -> Result<Vec<StoredPrediction>, SinkError> {
        SqlitePredictionReader::read(self, query)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PredictionsParams {
    pub location: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub pickup_location_id: String,
    pub pickup_hour: String,
    pub pickup_hour_ts_ms_utc: i64,
    pub predicted_rides: i32,
}

impl From<StoredPrediction> for PredictionRow {
    fn from(stored: StoredPrediction) -> Self {
        Self {
            pickup_hour: format_hour(stored.pickup_hour_ts_ms_utc),
            pickup_location_id: stored.pickup_location_id,
            pickup_hour_ts_ms_utc: stored.pickup_hour_ts_ms_utc,
            predicted_rides: stored.predicted_rides,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionsResponse {
    pub rows: Vec<PredictionRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Clone)]
struct PredictionsAppState {
    reader: Arc<dyn PredictionReader>,
}

pub fn predictions_router(reader: Arc<dyn PredictionReader>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/predictions", get(get_predictions))
        .with_state(PredictionsAppState { reader })
}

/// Turns raw query parameters into a store query; hours accept RFC 3339.
pub fn parse_predictions_params(params: &PredictionsParams) -> Result<PredictionQuery, String> {
    let location_id = params
        .location
        .as_deref()
        .map(canonical_location_id)
        .filter(|id| !id.is_empty());
    let from_ts_ms_utc = parse_bound("from", params.from.as_deref())?;
    let to_ts_ms_utc = parse_bound("to", params.to.as_deref())?;

    if let (Some(from), Some(to)) = (from_ts_ms_utc, to_ts_ms_utc) {
        if from > to {
            return Err(format!(
                "from ({}) is after to ({})",
                format_hour(from),
                format_hour(to)
            ));
        }
    }

    Ok(PredictionQuery {
        location_id,
        from_ts_ms_utc,
        to_ts_ms_utc,
    })
}

fn parse_bound(name: &str, raw: Option<&str>) -> Result<Option<i64>, String> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => parse_hour_ts_ms_utc(value)
            .map(Some)
            .ok_or_else(|| format!("invalid {name} timestamp '{value}'")),
    }
}

async fn get_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_predictions(
    State(state): State<PredictionsAppState>,
    Query(params): Query<PredictionsParams>,
) -> Response {
    let query = match parse_predictions_params(&params) {
        Ok(query) => query,
        Err(error) => {
            warn!(
                component = "api",
                event = "http.predictions.bad_request",
                error = %error
            );
            return (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response();
        }
    };

    let reader = Arc::clone(&state.reader);
    let lookup = query.clone();
    let result = tokio::task::spawn_blocking(move || reader.read(&lookup)).await;

    match result {
        Ok(Ok(stored)) => {
            info!(
                component = "api",
                event = "http.predictions.request",
                location = query.location_id.as_deref().unwrap_or("*"),
                rows = stored.len()
            );
            let rows = stored.into_iter().map(PredictionRow::from).collect();
            Json(PredictionsResponse { rows }).into_response()
        }
        Ok(Err(err)) => internal_error(err.to_string()),
        Err(err) => internal_error(err.to_string()),
    }
}

fn internal_error(error: String) -> Response {
    warn!(
        component = "api",
        event = "http.predictions.error",
        error = %error
    );
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error })).into_response()
}
