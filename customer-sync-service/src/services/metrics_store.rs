//! Per-customer metrics time series and the daily analytics aggregate.

use crate::models::{CustomerMetrics, DailyAnalytics, SubscriptionStatus, SyncStatus};
use crate::services::database::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::PgExecutor;
use tracing::instrument;

macro_rules! metrics_columns {
    () => {
        "stripe_customer_id, metric_date, total_revenue, subscription_count, \
         active_subscription_count, lifetime_value, average_order_value, last_payment_date, \
         churn_risk_score, health_score"
    };
}

macro_rules! analytics_columns {
    () => {
        "date, new_customers, churned_customers, total_active_customers, total_revenue, \
         average_revenue_per_customer, new_subscriptions, canceled_subscriptions"
    };
}

pub struct MetricsStore;

impl MetricsStore {
    /// Write the row for (customer, metric_date), replacing any earlier row for that day.
    #[instrument(skip(executor, metrics), fields(stripe_customer_id = %metrics.stripe_customer_id, metric_date = %metrics.metric_date))]
    pub async fn upsert_customer_metrics<'e, E: PgExecutor<'e>>(
        executor: E,
        metrics: &CustomerMetrics,
    ) -> Result<CustomerMetrics, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_customer_metrics"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerMetrics>(concat!(
            "INSERT INTO customer_metrics (",
            metrics_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (stripe_customer_id, metric_date) DO UPDATE \
             SET total_revenue = EXCLUDED.total_revenue, \
                 subscription_count = EXCLUDED.subscription_count, \
                 active_subscription_count = EXCLUDED.active_subscription_count, \
                 lifetime_value = EXCLUDED.lifetime_value, \
                 average_order_value = EXCLUDED.average_order_value, \
                 last_payment_date = EXCLUDED.last_payment_date, \
                 churn_risk_score = EXCLUDED.churn_risk_score, \
                 health_score = EXCLUDED.health_score, \
                 updated_utc = NOW() \
             RETURNING ",
            metrics_columns!()
        ))
        .bind(&metrics.stripe_customer_id)
        .bind(metrics.metric_date)
        .bind(metrics.total_revenue)
        .bind(metrics.subscription_count)
        .bind(metrics.active_subscription_count)
        .bind(metrics.lifetime_value)
        .bind(metrics.average_order_value)
        .bind(metrics.last_payment_date)
        .bind(metrics.churn_risk_score)
        .bind(metrics.health_score)
        .fetch_one(executor)
        .await
        .map_err(|e| db_error("upsert customer metrics", e))?;

        timer.observe_duration();
        Ok(row)
    }

    #[instrument(skip(executor))]
    pub async fn latest<'e, E: PgExecutor<'e>>(
        executor: E,
        stripe_customer_id: &str,
    ) -> Result<Option<CustomerMetrics>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_customer_metrics"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerMetrics>(concat!(
            "SELECT ",
            metrics_columns!(),
            " FROM customer_metrics WHERE stripe_customer_id = $1 \
              ORDER BY metric_date DESC LIMIT 1"
        ))
        .bind(stripe_customer_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("fetch latest customer metrics", e))?;

        timer.observe_duration();
        Ok(row)
    }

    /// Newest first.
    #[instrument(skip(executor))]
    pub async fn history<'e, E: PgExecutor<'e>>(
        executor: E,
        stripe_customer_id: &str,
        limit: i64,
    ) -> Result<Vec<CustomerMetrics>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["customer_metrics_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, CustomerMetrics>(concat!(
            "SELECT ",
            metrics_columns!(),
            " FROM customer_metrics WHERE stripe_customer_id = $1 \
              ORDER BY metric_date DESC LIMIT $2"
        ))
        .bind(stripe_customer_id)
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("fetch customer metrics history", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    /// Rebuild the aggregate row for `date` from current state and replace
    /// whatever was stored for that date.
    #[instrument(skip(executor))]
    pub async fn recompute_daily_analytics<'e, E: PgExecutor<'e>>(
        executor: E,
        date: NaiveDate,
    ) -> Result<DailyAnalytics, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recompute_daily_analytics"])
            .start_timer();

        let row = sqlx::query_as::<_, DailyAnalytics>(concat!(
            "INSERT INTO customer_analytics_daily (",
            analytics_columns!(),
            ") \
             SELECT $1, s.new_customers, s.churned_customers, s.total_active_customers, \
                    s.total_revenue, \
                    CASE WHEN s.total_active_customers > 0 \
                         THEN s.total_revenue / s.total_active_customers ELSE 0 END, \
                    s.new_subscriptions, s.canceled_subscriptions \
             FROM ( \
                 SELECT \
                   (SELECT COUNT(*) FROM customers \
                     WHERE (provider_created_at AT TIME ZONE 'UTC')::date = $1)::INT \
                     AS new_customers, \
                   (SELECT COUNT(DISTINCT c.stripe_customer_id) FROM customer_subscriptions c \
                     WHERE (c.canceled_at AT TIME ZONE 'UTC')::date = $1 \
                       AND NOT EXISTS (SELECT 1 FROM customer_subscriptions a \
                                        WHERE a.stripe_customer_id = c.stripe_customer_id \
                                          AND a.status = $2))::INT \
                     AS churned_customers, \
                   (SELECT COUNT(DISTINCT stripe_customer_id) FROM customer_subscriptions \
                     WHERE status = $2)::INT AS total_active_customers, \
                   (SELECT COALESCE(SUM(total_revenue), 0) FROM customer_metrics \
                     WHERE metric_date = $1)::BIGINT AS total_revenue, \
                   (SELECT COUNT(*) FROM customer_subscriptions \
                     WHERE (provider_created_at AT TIME ZONE 'UTC')::date = $1)::INT \
                     AS new_subscriptions, \
                   (SELECT COUNT(*) FROM customer_subscriptions \
                     WHERE (canceled_at AT TIME ZONE 'UTC')::date = $1)::INT \
                     AS canceled_subscriptions \
             ) s \
             ON CONFLICT (date) DO UPDATE \
             SET new_customers = EXCLUDED.new_customers, \
                 churned_customers = EXCLUDED.churned_customers, \
                 total_active_customers = EXCLUDED.total_active_customers, \
                 total_revenue = EXCLUDED.total_revenue, \
                 average_revenue_per_customer = EXCLUDED.average_revenue_per_customer, \
                 new_subscriptions = EXCLUDED.new_subscriptions, \
                 canceled_subscriptions = EXCLUDED.canceled_subscriptions, \
                 updated_utc = NOW() \
             RETURNING ",
            analytics_columns!()
        ))
        .bind(date)
        .bind(SubscriptionStatus::Active.as_str())
        .fetch_one(executor)
        .await
        .map_err(|e| db_error("recompute daily analytics", e))?;

        timer.observe_duration();
        Ok(row)
    }

    /// The most recent `days` aggregate rows, newest first.
    #[instrument(skip(executor))]
    pub async fn list_daily<'e, E: PgExecutor<'e>>(
        executor: E,
        days: i64,
    ) -> Result<Vec<DailyAnalytics>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_daily_analytics"])
            .start_timer();

        let rows = sqlx::query_as::<_, DailyAnalytics>(concat!(
            "SELECT ",
            analytics_columns!(),
            " FROM customer_analytics_daily ORDER BY date DESC LIMIT $1"
        ))
        .bind(days)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("list daily analytics", e))?;

        timer.observe_duration();
        Ok(rows)
    }

    /// Sync freshness counters; `since` bounds "recently synced".
    #[instrument(skip(executor))]
    pub async fn sync_status<'e, E: PgExecutor<'e>>(
        executor: E,
        since: DateTime<Utc>,
    ) -> Result<SyncStatus, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["sync_status"])
            .start_timer();

        let (last_sync, total_customers, recently_synced, total_subscriptions, active_subscriptions) =
            sqlx::query_as::<_, (Option<DateTime<Utc>>, i64, i64, i64, i64)>(
                "SELECT \
                   (SELECT MAX(last_sync_at) FROM customers), \
                   (SELECT COUNT(*) FROM customers), \
                   (SELECT COUNT(*) FROM customers WHERE last_sync_at >= $1), \
                   (SELECT COUNT(*) FROM customer_subscriptions), \
                   (SELECT COUNT(*) FROM customer_subscriptions WHERE status = $2)",
            )
            .bind(since)
            .bind(SubscriptionStatus::Active.as_str())
            .fetch_one(executor)
            .await
            .map_err(|e| db_error("read sync status", e))?;

        timer.observe_duration();

        Ok(SyncStatus {
            last_sync,
            total_customers,
            recently_synced,
            total_subscriptions,
            active_subscriptions,
            sync_health: SyncStatus::health_ratio(recently_synced, total_customers),
        })
    }
}
