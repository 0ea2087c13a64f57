use crate::handlers::parse_optional_json;
use crate::models::DailyAnalytics;
use crate::startup::AppState;
use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

const MAX_DAYS: i64 = 365;

#[derive(Debug, Deserialize)]
pub struct DailyAnalyticsQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    30
}

#[derive(Debug, Serialize)]
pub struct DailyAnalyticsResponse {
    pub days: Vec<DailyAnalytics>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecomputeRequest {
    /// Defaults to today (UTC).
    pub date: Option<NaiveDate>,
}

#[tracing::instrument(skip(state))]
pub async fn list_daily_analytics(
    State(state): State<AppState>,
    Query(query): Query<DailyAnalyticsQuery>,
) -> Result<Json<DailyAnalyticsResponse>, AppError> {
    let days = state
        .orchestrator
        .repository()
        .list_daily_analytics(query.days.clamp(1, MAX_DAYS))
        .await?;

    Ok(Json(DailyAnalyticsResponse {
        count: days.len(),
        days,
    }))
}

/// Rebuild one day's aggregate; rerunning replaces the row.
#[tracing::instrument(skip(state, body))]
pub async fn recompute_daily_analytics(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DailyAnalytics>, AppError> {
    let req: RecomputeRequest = parse_optional_json(&body)?;
    let date = req.date.unwrap_or_else(|| Utc::now().date_naive());

    tracing::info!(date = %date, "Recomputing daily analytics");
    let row = state
        .orchestrator
        .repository()
        .recompute_daily_analytics(date)
        .await?;

    Ok(Json(row))
}
