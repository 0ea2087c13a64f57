//! Customer record store, keyed by provider customer id.

use crate::models::{Customer, CustomerData, CustomerRow, WriteOutcome};
use crate::services::database::db_error;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::{PgConnection, PgExecutor};
use std::collections::HashSet;
use tracing::instrument;
use uuid::Uuid;

macro_rules! customer_columns {
    () => {
        "customer_id, stripe_customer_id, email, name, description, phone, address, metadata, \
         currency, deleted, delinquent, balance, provider_created_at, last_sync_at, created_utc, \
         updated_utc"
    };
}

pub struct CustomerStore;

impl CustomerStore {
    #[instrument(skip(executor))]
    pub async fn find_by_provider_id<'e, E: PgExecutor<'e>>(
        executor: E,
        stripe_customer_id: &str,
    ) -> Result<Option<Customer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerRow>(concat!(
            "SELECT ",
            customer_columns!(),
            " FROM customers WHERE stripe_customer_id = $1"
        ))
        .bind(stripe_customer_id)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("find customer", e))?;

        timer.observe_duration();

        row.map(Customer::try_from).transpose()
    }

    /// Which of `ids` already have a local row, in one query.
    #[instrument(skip(executor, ids), fields(batch_size = ids.len()))]
    pub async fn batch_existence_check<'e, E: PgExecutor<'e>>(
        executor: E,
        ids: &[String],
    ) -> Result<HashSet<String>, AppError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["batch_existence_check"])
            .start_timer();

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT stripe_customer_id FROM customers WHERE stripe_customer_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(executor)
        .await
        .map_err(|e| db_error("check customer existence", e))?;

        timer.observe_duration();

        Ok(existing.into_iter().collect())
    }

    /// Create or update depending on whether the row exists.
    ///
    /// `known_exists` carries a batch pre-check result; `None` looks the row up.
    #[instrument(skip(conn, data), fields(stripe_customer_id = %data.stripe_customer_id))]
    pub async fn save(
        conn: &mut PgConnection,
        data: &CustomerData,
        sync_at: DateTime<Utc>,
        known_exists: Option<bool>,
    ) -> Result<(Customer, WriteOutcome), AppError> {
        let exists = match known_exists {
            Some(exists) => exists,
            None => Self::find_by_provider_id(&mut *conn, &data.stripe_customer_id)
                .await?
                .is_some(),
        };

        if exists {
            let customer = Self::update(&mut *conn, data, sync_at).await?;
            Ok((customer, WriteOutcome::Updated))
        } else {
            let customer = Self::create(&mut *conn, data, sync_at).await?;
            Ok((customer, WriteOutcome::Created))
        }
    }

    #[instrument(skip(executor, data), fields(stripe_customer_id = %data.stripe_customer_id))]
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CustomerData,
        sync_at: DateTime<Utc>,
    ) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerRow>(concat!(
            "INSERT INTO customers (customer_id, stripe_customer_id, email, name, description, \
             phone, address, metadata, currency, deleted, delinquent, balance, provider_created_at, \
             last_sync_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             RETURNING ",
            customer_columns!()
        ))
        .bind(Uuid::new_v4())
        .bind(&data.stripe_customer_id)
        .bind(&data.email)
        .bind(&data.name)
        .bind(&data.description)
        .bind(&data.phone)
        .bind(data.address_json()?)
        .bind(data.metadata_json()?)
        .bind(&data.currency)
        .bind(data.deleted)
        .bind(data.delinquent)
        .bind(data.balance)
        .bind(data.provider_created_at)
        .bind(sync_at)
        .fetch_one(executor)
        .await
        .map_err(|e| db_error("create customer", e))?;

        timer.observe_duration();

        Customer::try_from(row)
    }

    /// Full replace of the mutable attribute set. `last_sync_at` never moves backwards.
    #[instrument(skip(executor, data), fields(stripe_customer_id = %data.stripe_customer_id))]
    pub async fn update<'e, E: PgExecutor<'e>>(
        executor: E,
        data: &CustomerData,
        sync_at: DateTime<Utc>,
    ) -> Result<Customer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_customer"])
            .start_timer();

        let row = sqlx::query_as::<_, CustomerRow>(concat!(
            "UPDATE customers \
             SET email = $2, name = $3, description = $4, phone = $5, address = $6, \
                 metadata = $7, currency = $8, deleted = $9, delinquent = $10, balance = $11, \
                 provider_created_at = $12, last_sync_at = GREATEST(last_sync_at, $13), \
                 updated_utc = NOW() \
             WHERE stripe_customer_id = $1 \
             RETURNING ",
            customer_columns!()
        ))
        .bind(&data.stripe_customer_id)
        .bind(&data.email)
        .bind(&data.name)
        .bind(&data.description)
        .bind(&data.phone)
        .bind(data.address_json()?)
        .bind(data.metadata_json()?)
        .bind(&data.currency)
        .bind(data.deleted)
        .bind(data.delinquent)
        .bind(data.balance)
        .bind(data.provider_created_at)
        .bind(sync_at)
        .fetch_optional(executor)
        .await
        .map_err(|e| db_error("update customer", e))?;

        timer.observe_duration();

        let row = row.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Customer {} vanished before update",
                data.stripe_customer_id
            ))
        })?;
        Customer::try_from(row)
    }
}
