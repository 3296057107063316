//! HTTP route handlers

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use super::AppState;
use crate::aggregation::RunOutcome;
use crate::cache::CacheStatus;
use crate::counts::DetectionPayload;
use crate::db::StoredDetection;
use crate::error::ApiError;

fn success<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "status": "success", "data": data }))
}

fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        ApiError::validation(
            "INVALID_DATE_FORMAT",
            format!("invalid date '{raw}', expected YYYY-MM-DD"),
        )
    })
}

fn require_operator(headers: &HeaderMap, token: &str) -> Result<(), ApiError> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(p) if !token.is_empty() && p == token => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// GET /api/ - endpoint overview
pub async fn api_index() -> Json<serde_json::Value> {
    Json(json!({
        "service": "footfall-analytics",
        "endpoints": {
            "POST /api/detections": "ingest a per-minute detection record",
            "GET /api/detections": "recent raw records (hours, limit)",
            "GET /api/stats/today": "today's merged stats (include_demographics)",
            "GET /api/stats/range/{start}/{end}": "stats for an inclusive date range",
            "GET /api/daily": "daily rollup rows (start_date, end_date, limit)",
            "GET /api/monthly": "monthly rollup rows (start_year, start_month, end_year, end_month, limit)",
            "POST /api/trigger-aggregation": "operator: run an aggregation pass now",
            "GET /api/aggregation/status": "operator: backlog and last run (verify_date)",
            "GET /api/settings": "detector script settings",
            "GET /api/health": "liveness and dependency probes",
            "GET /api/events": "SSE stream of accepted detections",
        }
    }))
}

/// POST /api/detections
///
/// Accepts either the 12-bucket payload or the simplified {male, female}
/// pair, stores it, announces it on the event bus, and nudges the
/// aggregation scheduler with the record's date.
pub async fn ingest_detection(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let payload: DetectionPayload = serde_json::from_slice(&body).map_err(|e| {
        ApiError::validation(
            "INVALID_PAYLOAD_FORMAT",
            format!("malformed detection payload: {e}"),
        )
    })?;
    let (timestamp, counts) = payload.into_counts()?;

    let id = state.db.insert_detection(timestamp, &counts).await?;
    state.event_bus.publish(StoredDetection {
        id,
        timestamp,
        counts,
        aggregated: false,
    });

    // Keep today reads fresh and let the scheduler know work is pending.
    let date = timestamp.date_naive();
    state.cache.invalidate_dates(&[date]).await;
    let _ = state.date_tx.send(date);

    Ok((
        StatusCode::CREATED,
        success(json!({
            "id": id,
            "timestamp": timestamp,
            "totals": counts.totals(),
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_hours")]
    pub hours: i64,
    #[serde(default = "default_recent_limit")]
    pub limit: i64,
}

fn default_hours() -> i64 {
    24
}

fn default_recent_limit() -> i64 {
    100
}

/// GET /api/detections
pub async fn list_detections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hours = query.hours.clamp(1, 24 * 31);
    let limit = query.limit.clamp(1, 1000);
    let detections = state.db.recent_detections(hours, limit).await?;
    Ok(success(json!({
        "count": detections.len(),
        "detections": detections,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DemographicsQuery {
    #[serde(default)]
    pub include_demographics: bool,
}

/// GET /api/stats/today
pub async fn stats_today(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DemographicsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.stats.today(query.include_demographics).await?;
    Ok(success(stats))
}

/// GET /api/stats/range/:start/:end
pub async fn stats_range(
    State(state): State<Arc<AppState>>,
    Path((start, end)): Path<(String, String)>,
    Query(query): Query<DemographicsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let start = parse_date(&start)?;
    let end = parse_date(&end)?;
    let stats = state
        .stats
        .range(start, end, query.include_demographics)
        .await?;
    Ok(success(stats))
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default = "default_daily_limit")]
    pub limit: i64,
}

fn default_daily_limit() -> i64 {
    31
}

/// GET /api/daily - rollup rows, newest first
pub async fn list_daily(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DailyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let start = query.start_date.as_deref().map(parse_date).transpose()?;
    let end = query.end_date.as_deref().map(parse_date).transpose()?;
    let rows = state
        .db
        .daily_rollups_page(start, end, query.limit.clamp(1, 366))
        .await?;
    Ok(success(json!({ "count": rows.len(), "daily": rows })))
}

#[derive(Debug, Deserialize)]
pub struct MonthlyQuery {
    pub start_year: Option<i32>,
    pub start_month: Option<u32>,
    pub end_year: Option<i32>,
    pub end_month: Option<u32>,
    #[serde(default = "default_monthly_limit")]
    pub limit: i64,
}

fn default_monthly_limit() -> i64 {
    24
}

/// GET /api/monthly
pub async fn list_monthly(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MonthlyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let rows = match (
        query.start_year,
        query.start_month,
        query.end_year,
        query.end_month,
    ) {
        (Some(sy), Some(sm), Some(ey), Some(em)) => {
            if !(1..=12).contains(&sm) || !(1..=12).contains(&em) {
                return Err(ApiError::validation(
                    "INVALID_DATE_FORMAT",
                    "month must be between 1 and 12",
                ));
            }
            state.db.monthly_rollups_range(sy, sm, ey, em).await?
        }
        _ => {
            state
                .db
                .monthly_rollups_page(query.limit.clamp(1, 120))
                .await?
        }
    };
    Ok(success(json!({ "count": rows.len(), "monthly": rows })))
}

/// POST /api/trigger-aggregation (operator)
pub async fn trigger_aggregation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_operator(&headers, &state.config.auth.operator_token)?;

    match state.engine.run().await {
        Ok(RunOutcome::Completed(report)) => {
            let message = if report.records_processed == 0 {
                "no unaggregated records"
            } else {
                "aggregation complete"
            };
            Ok((
                StatusCode::OK,
                success(json!({ "message": message, "report": report })),
            )
                .into_response())
        }
        Ok(RunOutcome::AlreadyRunning) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "processing",
                "message": "an aggregation pass is already running",
            })),
        )
            .into_response()),
        Err(halted) => {
            error!("triggered aggregation halted: {}", halted);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "code": "AGGREGATION_FAILED",
                    "message": format!(
                        "aggregation halted after {} records",
                        halted.partial.records_processed
                    ),
                    "partial": halted.partial,
                })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub verify_date: Option<String>,
}

/// GET /api/aggregation/status (operator)
pub async fn aggregation_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_operator(&headers, &state.config.auth.operator_token)?;

    let status = state.engine.status().await?;
    let verification = match query.verify_date.as_deref() {
        Some(raw) => Some(state.engine.verify(parse_date(raw)?).await?),
        None => None,
    };

    Ok(success(json!({
        "detection_records": status.detection_records,
        "unaggregated_records": status.unaggregated_records,
        "daily_rollups": status.daily_rollups,
        "monthly_rollups": status.monthly_rollups,
        "last_run": status.last_run,
        "verification": verification,
    })))
}

/// GET /api/settings - pass-through for detector scripts
pub async fn detector_settings(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    success(json!({
        "confidence_threshold_person": state.config.detection.confidence_threshold_person,
        "confidence_threshold_face": state.config.detection.confidence_threshold_face,
        "log_interval_secs": state.config.detection.log_interval_secs,
    }))
}

/// GET /api/health - not rate limited
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let db_up = state.db.health_check().await.is_ok();
    let cache = state.cache.status().await;

    let label = if !db_up {
        "unhealthy"
    } else if cache == CacheStatus::Degraded {
        "degraded"
    } else {
        "healthy"
    };
    let code = if db_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": label,
            "database": if db_up { "up" } else { "down" },
            "cache": cache,
        })),
    )
        .into_response()
}
