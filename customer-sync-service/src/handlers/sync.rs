use crate::handlers::{parse_optional_json, validate_customer_id};
use crate::models::{SyncStats, SyncStatus};
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use validator::Validate;

/// Body of `POST /customers/sync`. No `customer_id` means a full sync.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SyncRequest {
    #[validate(length(min = 1, max = 255, message = "customer_id must be 1-255 characters"))]
    pub customer_id: Option<String>,
    /// Accepted for compatibility; every sync rewrites full rows.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub data: SyncStats,
}

/// Runs the sync to completion before answering. Partial failures are in
/// `data.customers.errors` and `data.subscriptions.errors`.
#[tracing::instrument(skip(state, body))]
pub async fn trigger_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncResponse>, AppError> {
    let req: SyncRequest = parse_optional_json(&body)?;
    req.validate()?;
    if let Some(customer_id) = req.customer_id.as_deref() {
        validate_customer_id(customer_id)?;
    }

    let stats = match req.customer_id.as_deref() {
        Some(customer_id) => {
            tracing::info!(customer_id = %customer_id, force = req.force, "Single customer sync requested");
            state
                .orchestrator
                .sync_single_customer_by_id(customer_id)
                .await?
        }
        None => {
            tracing::info!(force = req.force, "Full customer sync requested");
            state.orchestrator.sync_all_customers().await?
        }
    };

    Ok(Json(SyncResponse {
        success: true,
        data: stats,
    }))
}

#[tracing::instrument(skip(state))]
pub async fn sync_status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    let since = Utc::now() - state.recent_window;
    let status = state.orchestrator.repository().sync_status(since).await?;
    Ok(Json(status))
}
