//! HTTP query endpoints.
//!
//! Every handler takes the query store lock for the duration of one query
//! only. Nothing here writes to the database.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Bad filter
//! values return HTTP 400; storage failures return HTTP 500.
//!
//! # Example
//!
//! ```ignore
//! use fieldnode_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use fieldnode_store::{HourlyAverage, ReadingQuery, StoredDevice, StoredReading};
use fieldnode_types::ReadingShape;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::bus::ConnectionState;
use crate::ingest::IngestStatsSnapshot;
use crate::state::AppState;

/// Largest accepted `limit` for reading listings.
pub const MAX_LIMIT: u32 = 10_000;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/hourly", get(get_device_hourly))
        .route("/readings", get(get_readings))
        .route("/readings/hourly", get(get_hourly))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status response.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: i64,
    /// Whether a bus session feeds this instance.
    pub ingest_enabled: bool,
    pub connection: ConnectionState,
    pub topic: String,
    pub ingest: IngestStatsSnapshot,
    pub storage: StorageStatus,
}

/// Store summary for [`StatusResponse`].
#[derive(Debug, Serialize)]
pub struct StorageStatus {
    pub shape: ReadingShape,
    pub reading_count: u64,
    pub device_count: usize,
    pub max_records: u64,
}

/// Get service status.
async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let storage = {
        let store = state.store.lock().await;
        StorageStatus {
            shape: store.shape(),
            reading_count: store.count_readings(None)?,
            device_count: store.list_devices()?.len(),
            max_records: store.max_records(),
        }
    };

    let now = OffsetDateTime::now_utc();
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_seconds: (now - state.started_at).whole_seconds(),
        ingest_enabled: state.ingest_enabled(),
        connection: state.connection_state(),
        topic: state.config.mqtt.topic.clone(),
        ingest: state.stats.snapshot(),
        storage,
    }))
}

/// List all devices, most recently seen first.
async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StoredDevice>>, AppError> {
    let store = state.store.lock().await;
    Ok(Json(store.list_devices()?))
}

/// Get a single device.
async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoredDevice>, AppError> {
    let store = state.store.lock().await;
    let device = store
        .get_device(&id)?
        .ok_or_else(|| AppError::NotFound(format!("Device not found: {}", id)))?;
    Ok(Json(device))
}

/// Query parameters for reading endpoints.
///
/// Numbers are taken signed so that out-of-range values produce a
/// descriptive 400 instead of a deserialization failure.
#[derive(Debug, Deserialize, Default)]
pub struct ReadingsParams {
    pub device_id: Option<String>,
    pub sensor_type: Option<String>,
    pub hours: Option<i64>,
    pub limit: Option<i64>,
}

impl ReadingsParams {
    /// Validate the parameters and build a store query.
    pub fn to_query(&self) -> Result<ReadingQuery, AppError> {
        let mut query = ReadingQuery::new();

        if let Some(ref device_id) = self.device_id {
            query = query.device(device_id);
        }
        if let Some(ref sensor_type) = self.sensor_type {
            query = query.sensor_type(sensor_type);
        }
        if let Some(hours) = self.hours {
            let hours = u32::try_from(hours)
                .ok()
                .filter(|h| *h > 0)
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Invalid hours: {} (must be a positive integer)",
                        hours
                    ))
                })?;
            query = query.hours(hours);
        }
        if let Some(limit) = self.limit {
            let limit = u32::try_from(limit)
                .ok()
                .filter(|l| (1..=MAX_LIMIT).contains(l))
                .ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "Invalid limit: {} (must be between 1 and {})",
                        limit, MAX_LIMIT
                    ))
                })?;
            query = query.limit(limit);
        }

        Ok(query)
    }
}

fn params(
    params: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<ReadingsParams, AppError> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

/// Reading listing response.
#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub readings: Vec<StoredReading>,
}

/// List readings, newest first.
///
/// # Query Parameters
///
/// - `device_id`: only readings from this device
/// - `sensor_type`: only this sensor (narrow stores only)
/// - `hours`: only readings from the trailing window
/// - `limit`: maximum number of rows (default 100)
async fn get_readings(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let query = params(query)?.to_query()?;

    let store = state.store.lock().await;
    let readings = store.query_readings(&query)?;
    Ok(Json(ReadingsResponse { readings }))
}

type HourlyResponse = BTreeMap<String, Vec<HourlyAverage>>;

/// Hourly means per sensor type.
async fn get_hourly(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<Json<HourlyResponse>, AppError> {
    let query = params(query)?.to_query()?;

    let store = state.store.lock().await;
    Ok(Json(store.hourly_averages(&query)?))
}

/// Hourly means per sensor type for one device.
async fn get_device_hourly(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<ReadingsParams>, QueryRejection>,
) -> Result<Json<HourlyResponse>, AppError> {
    let query = params(query)?.to_query()?.device(&id);

    let store = state.store.lock().await;
    Ok(Json(store.hourly_averages(&query)?))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Store(fieldnode_store::Error),
}

impl From<fieldnode_store::Error> for AppError {
    fn from(e: fieldnode_store::Error) -> Self {
        match e {
            fieldnode_store::Error::UnsupportedFilter(msg) => AppError::BadRequest(msg),
            e => AppError::Store(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Store(e) => {
                tracing::error!("Query failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}
