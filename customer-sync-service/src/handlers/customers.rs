use crate::handlers::validate_customer_id;
use crate::models::{Customer, CustomerMetrics, Subscription};
use crate::providers::{Invoice, PageParams, PaymentMethod};
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;

const MAX_HISTORY: i64 = 365;

#[derive(Debug, Serialize)]
pub struct CustomerDetailResponse {
    pub customer: Customer,
    pub subscriptions: Vec<Subscription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<CustomerMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct MetricsHistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    30
}

#[derive(Debug, Serialize)]
pub struct MetricsHistoryResponse {
    pub customer_id: String,
    pub metrics: Vec<CustomerMetrics>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct BillingResponse {
    pub customer_id: String,
    pub payment_methods: Vec<PaymentMethod>,
    pub invoices: Vec<Invoice>,
    pub has_more_invoices: bool,
}

#[tracing::instrument(skip(state))]
pub async fn get_customer(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<CustomerDetailResponse>, AppError> {
    validate_customer_id(&customer_id)?;
    let repository = state.orchestrator.repository();

    let customer = repository.find_customer(&customer_id).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("Customer not found: {}", customer_id))
    })?;
    let subscriptions = repository.list_subscriptions(&customer_id).await?;
    let metrics = repository.latest_metrics(&customer_id).await?;

    Ok(Json(CustomerDetailResponse {
        customer,
        subscriptions,
        metrics,
    }))
}

/// Metrics time series, newest first.
#[tracing::instrument(skip(state))]
pub async fn get_customer_metrics(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<MetricsHistoryQuery>,
) -> Result<Json<MetricsHistoryResponse>, AppError> {
    validate_customer_id(&customer_id)?;
    let limit = query.limit.clamp(1, MAX_HISTORY);
    let metrics = state
        .orchestrator
        .repository()
        .metrics_history(&customer_id, limit)
        .await?;

    Ok(Json(MetricsHistoryResponse {
        customer_id,
        count: metrics.len(),
        metrics,
    }))
}

/// Read-through to the provider; nothing is stored.
#[tracing::instrument(skip(state))]
pub async fn get_customer_billing(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<BillingResponse>, AppError> {
    validate_customer_id(&customer_id)?;
    let provider = state.orchestrator.provider();

    let payment_methods = provider.list_payment_methods(&customer_id).await?;
    let invoices = provider
        .list_invoices(&customer_id, &PageParams::first(state.invoice_page_size))
        .await?;

    Ok(Json(BillingResponse {
        customer_id,
        payment_methods,
        has_more_invoices: invoices.next_cursor.is_some(),
        invoices: invoices.data,
    }))
}
