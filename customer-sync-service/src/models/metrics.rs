//! Per-customer metrics and platform-wide daily aggregates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// One row per customer per calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct CustomerMetrics {
    pub stripe_customer_id: String,
    pub metric_date: NaiveDate,
    /// Monthly recurring revenue of active subscriptions, minor units.
    pub total_revenue: i64,
    pub subscription_count: i32,
    pub active_subscription_count: i32,
    pub lifetime_value: i64,
    pub average_order_value: i64,
    pub last_payment_date: Option<NaiveDate>,
    pub churn_risk_score: f64,
    pub health_score: i32,
}

/// One row per calendar date; recomputation replaces the row.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct DailyAnalytics {
    pub date: NaiveDate,
    pub new_customers: i32,
    pub churned_customers: i32,
    pub total_active_customers: i32,
    pub total_revenue: i64,
    pub average_revenue_per_customer: i64,
    pub new_subscriptions: i32,
    pub canceled_subscriptions: i32,
}

impl DailyAnalytics {
    pub fn average_revenue(total_revenue: i64, active_customers: i32) -> i64 {
        if active_customers > 0 {
            total_revenue / i64::from(active_customers)
        } else {
            0
        }
    }
}

/// Snapshot served by `GET /customers/sync/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub total_customers: i64,
    pub recently_synced: i64,
    pub total_subscriptions: i64,
    pub active_subscriptions: i64,
    /// recently_synced / total_customers, 0 when there are no customers.
    pub sync_health: f64,
}

impl SyncStatus {
    pub fn health_ratio(recently_synced: i64, total_customers: i64) -> f64 {
        if total_customers > 0 {
            recently_synced as f64 / total_customers as f64
        } else {
            0.0
        }
    }
}
