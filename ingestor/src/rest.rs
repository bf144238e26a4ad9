use crate::db::Storage;
use crate::metrics::Metrics;
use crate::model::{DeviceRecord, ReadingsResponse, StoredReading};
use crate::rollup::RollupSnapshot;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::error;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 1000;
const EXPORT_LIMIT: u32 = 1000;
const CSV_HEADER: &str = "ID,Device ID,Temperature,Humidity,Light Level,Voltage,Timestamp";

#[derive(Clone)]
struct AppState {
    storage: Storage,
    metrics: Arc<Metrics>,
    rollup: watch::Receiver<Arc<RollupSnapshot>>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    format: ExportFormat,
}

#[derive(Debug, Serialize)]
struct ExportResponse {
    data: Vec<StoredReading>,
    count: usize,
    exported_at: DateTime<Utc>,
}

/// Read-only views over storage. Nothing here writes.
pub fn create_router(
    storage: Storage,
    metrics: Arc<Metrics>,
    rollup: watch::Receiver<Arc<RollupSnapshot>>,
) -> Router {
    let state = AppState {
        storage,
        metrics,
        rollup,
    };

    Router::new()
        .route("/api/v1/readings", get(get_readings))
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/statistics", get(get_statistics))
        .route("/api/v1/export", get(export_readings))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let data = state
        .storage
        .recent(params.device_id.as_deref(), limit)
        .await?;

    Ok(Json(ReadingsResponse {
        count: data.len(),
        data,
        limit,
    }))
}

async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceRecord>>, AppError> {
    Ok(Json(state.storage.devices().await?))
}

async fn get_statistics(State(state): State<AppState>) -> Json<RollupSnapshot> {
    let snapshot = state.rollup.borrow().clone();
    Json(snapshot.as_ref().clone())
}

/// Latest readings across all devices, as JSON or as a CSV attachment.
async fn export_readings(
    State(state): State<AppState>,
    Query(params): Query<ExportQuery>,
) -> Result<Response, AppError> {
    let data = state.storage.recent(None, EXPORT_LIMIT).await?;
    if data.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "No data to export").into_response());
    }

    let response = match params.format {
        ExportFormat::Json => Json(ExportResponse {
            count: data.len(),
            data,
            exported_at: Utc::now(),
        })
        .into_response(),
        ExportFormat::Csv => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (
                    header::CONTENT_DISPOSITION,
                    "attachment; filename=sensor_data_export.csv",
                ),
            ],
            readings_to_csv(&data),
        )
            .into_response(),
    };
    Ok(response)
}

fn readings_to_csv(readings: &[StoredReading]) -> String {
    let mut out = String::with_capacity(64 * (readings.len() + 1));
    out.push_str(CSV_HEADER);
    out.push_str("\r\n");

    for r in readings {
        let row = [
            r.id.to_string(),
            csv_field(&r.device_id),
            optional(r.temperature),
            optional(r.humidity),
            optional(r.light_level),
            optional(r.voltage),
            r.timestamp.as_deref().map(csv_field).unwrap_or_default(),
        ];
        out.push_str(&row.join(","));
        out.push_str("\r\n");
    }
    out
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// Quote only when the value would otherwise break the row
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

async fn get_metrics(State(state): State<AppState>) -> Result<String, AppError> {
    state
        .metrics
        .gather()
        .map_err(|e| AppError(anyhow::anyhow!("Metrics encoding failed: {}", e)))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
