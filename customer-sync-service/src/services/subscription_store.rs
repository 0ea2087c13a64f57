//! Subscription record store, keyed by provider subscription id.

use crate::models::{Subscription, SubscriptionData, SubscriptionRow, WriteOutcome};
use crate::services::database::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use service_core::error::AppError;
use sqlx::{PgConnection, PgExecutor};
use tracing::instrument;
use uuid::Uuid;

macro_rules! subscription_columns {
    () => {
        "subscription_id, stripe_subscription_id, stripe_customer_id, stripe_price_id, \
         stripe_product_id, status, unit_amount, quantity, currency, billing_interval, \
         interval_count, current_period_start, current_period_end, cancel_at_period_end, \
         canceled_at, ended_at, trial_start, trial_end, provider_created_at, metadata, \
         created_utc, updated_utc"
    };
}

pub struct SubscriptionStore;

impl SubscriptionStore {
    #[instrument(skip(executor))]
    pub async fn find_by_provider_id<'e, E: PgExecutor<'e>>(
        executor: E,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM customer_subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("find subscription", e))?;

        timer.observe_duration();

        row.map(Subscription::try_from).transpose()
    }

    #[instrument(skip(executor))]
    pub async fn list_for_customer<'e, E: PgExecutor<'e>>(
        executor: E,
        stripe_customer_id: &str,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let rows = sqlx::query_as::<_, SubscriptionRow>(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM customer_subscriptions WHERE stripe_customer_id = $1 \
              ORDER BY provider_created_at DESC NULLS LAST, stripe_subscription_id"
        ))
        .bind(stripe_customer_id)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("list subscriptions", e))?;

        timer.observe_duration();

        rows.into_iter().map(Subscription::try_from).collect()
    }

    /// Create or update depending on whether the row exists.
    #[instrument(skip(conn, data), fields(stripe_subscription_id = %data.stripe_subscription_id))]
    pub async fn save(
        conn: &mut PgConnection,
        data: &SubscriptionData,
    ) -> Result<(Subscription, WriteOutcome), AppError> {
        let exists = Self::find_by_provider_id(&mut *conn, &data.stripe_subscription_id)
            .await?
            .is_some();

        if exists {
            let subscription = Self::update(&mut *conn, data).await?;
            Ok((subscription, WriteOutcome::Updated))
        } else {
            let subscription = Self::create(&mut *conn, data).await?;
            Ok((subscription, WriteOutcome::Created))
        }
    }

    #[instrument(skip(executor, data), fields(stripe_subscription_id = %data.stripe_subscription_id))]
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &SubscriptionData,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(concat!(
            "INSERT INTO customer_subscriptions (subscription_id, stripe_subscription_id, \
             stripe_customer_id, stripe_price_id, stripe_product_id, status, unit_amount, \
             quantity, currency, billing_interval, interval_count, current_period_start, \
             current_period_end, cancel_at_period_end, canceled_at, ended_at, trial_start, \
             trial_end, provider_created_at, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20) \
             RETURNING ",
            subscription_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(&data.stripe_subscription_id)
        .bind(&data.stripe_customer_id)
        .bind(&data.stripe_price_id)
        .bind(&data.stripe_product_id)
        .bind(data.status.as_str())
        .bind(data.unit_amount)
        .bind(data.quantity)
        .bind(&data.currency)
        .bind(data.interval.map(|i| i.as_str()))
        .bind(data.interval_count)
        .bind(data.current_period_start)
        .bind(data.current_period_end)
        .bind(data.cancel_at_period_end)
        .bind(data.canceled_at)
        .bind(data.ended_at)
        .bind(data.trial_start)
        .bind(data.trial_end)
        .bind(data.provider_created_at)
        .bind(data.metadata_json()?)
        .fetch_one(executor)
        .await
        .map_err(|e| db_error("create subscription", e))?;

        timer.observe_duration();

        Subscription::try_from(row)
    }

    /// Full replace of the mutable attribute set.
    #[instrument(skip(executor, data), fields(stripe_subscription_id = %data.stripe_subscription_id))]
    pub async fn update<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &SubscriptionData,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(concat!(
            "UPDATE customer_subscriptions \
             SET stripe_customer_id = $2, stripe_price_id = $3, stripe_product_id = $4, \
                 status = $5, unit_amount = $6, quantity = $7, currency = $8, \
                 billing_interval = $9, interval_count = $10, current_period_start = $11, \
                 current_period_end = $12, cancel_at_period_end = $13, canceled_at = $14, \
                 ended_at = $15, trial_start = $16, trial_end = $17, provider_created_at = $18, \
                 metadata = $19, updated_utc = NOW() \
             WHERE stripe_subscription_id = $1 \
             RETURNING ",
            subscription_columns!()
        ))
        .bind(&data.stripe_subscription_id)
        .bind(&data.stripe_customer_id)
        .bind(&data.stripe_price_id)
        .bind(&data.stripe_product_id)
        .bind(data.status.as_str())
        .bind(data.unit_amount)
        .bind(data.quantity)
        .bind(&data.currency)
        .bind(data.interval.map(|i| i.as_str()))
        .bind(data.interval_count)
        .bind(data.current_period_start)
        .bind(data.current_period_end)
        .bind(data.cancel_at_period_end)
        .bind(data.canceled_at)
        .bind(data.ended_at)
        .bind(data.trial_start)
        .bind(data.trial_end)
        .bind(data.provider_created_at)
        .bind(data.metadata_json()?)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("update subscription", e))?;

        timer.observe_duration();

        let row = row.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Subscription {} vanished before update",
                data.stripe_subscription_id
            ))
        })?;
        Subscription::try_from(row)
    }
}
