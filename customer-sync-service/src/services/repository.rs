//! Persistence seam used by the orchestrator and the HTTP handlers.

use crate::models::{
    Customer, CustomerData, CustomerMetrics, DailyAnalytics, Subscription, SubscriptionData,
    SyncStatus, WriteOutcome,
};
use crate::services::customer_store::CustomerStore;
use crate::services::database::{commit, Database};
use crate::services::metrics_store::MetricsStore;
use crate::services::subscription_store::SubscriptionStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Everything written for one customer in a single transaction.
#[derive(Debug, Clone)]
pub struct CustomerUnit {
    pub customer: CustomerData,
    /// Already validated; order is write order.
    pub subscriptions: Vec<SubscriptionData>,
    pub metrics: CustomerMetrics,
    pub sync_at: DateTime<Utc>,
}

/// Result of a committed unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub customer: WriteOutcome,
    pub subscriptions: Vec<(String, WriteOutcome)>,
    pub metrics: CustomerMetrics,
}

#[async_trait]
pub trait SyncRepository: Send + Sync {
    /// Which of `ids` already exist locally.
    async fn existing_customer_ids(&self, ids: &[String]) -> Result<HashSet<String>, AppError>;

    async fn find_customer(&self, stripe_customer_id: &str) -> Result<Option<Customer>, AppError>;

    async fn list_subscriptions(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Vec<Subscription>, AppError>;

    /// Customer, then subscriptions, then metrics, all or nothing.
    ///
    /// `known_exists` is the batch pre-check answer for the customer, if any.
    async fn apply_customer_unit(
        &self,
        unit: &CustomerUnit,
        known_exists: Option<bool>,
    ) -> Result<UnitOutcome, AppError>;

    async fn latest_metrics(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<CustomerMetrics>, AppError>;

    async fn metrics_history(
        &self,
        stripe_customer_id: &str,
        limit: i64,
    ) -> Result<Vec<CustomerMetrics>, AppError>;

    async fn recompute_daily_analytics(&self, date: NaiveDate) -> Result<DailyAnalytics, AppError>;

    async fn list_daily_analytics(&self, days: i64) -> Result<Vec<DailyAnalytics>, AppError>;

    async fn sync_status(&self, since: DateTime<Utc>) -> Result<SyncStatus, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;
}

/// Postgres-backed repository.
#[derive(Clone)]
pub struct PgSyncRepository {
    db: Database,
}

impl PgSyncRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl SyncRepository for PgSyncRepository {
    async fn existing_customer_ids(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        CustomerStore::batch_existence_check(self.db.pool(), ids).await
    }

    async fn find_customer(&self, stripe_customer_id: &str) -> Result<Option<Customer>, AppError> {
        CustomerStore::find_by_provider_id(self.db.pool(), stripe_customer_id).await
    }

    async fn list_subscriptions(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Vec<Subscription>, AppError> {
        SubscriptionStore::list_for_customer(self.db.pool(), stripe_customer_id).await
    }

    #[instrument(skip(self, unit), fields(stripe_customer_id = %unit.customer.stripe_customer_id))]
    async fn apply_customer_unit(
        &self,
        unit: &CustomerUnit,
        known_exists: Option<bool>,
    ) -> Result<UnitOutcome, AppError> {
        // Any early return drops `tx`, which rolls the unit back.
        let mut tx = self.db.begin().await?;

        let (_, customer_outcome) =
            CustomerStore::save(&mut *tx, &unit.customer, unit.sync_at, known_exists).await?;

        let mut subscriptions = Vec::with_capacity(unit.subscriptions.len());
        for data in &unit.subscriptions {
            let (_, outcome) = SubscriptionStore::save(&mut *tx, data).await?;
            subscriptions.push((data.stripe_subscription_id.clone(), outcome));
        }

        let metrics = MetricsStore::upsert_customer_metrics(&mut *tx, &unit.metrics).await?;

        commit(tx).await?;

        debug!(
            outcome = ?customer_outcome,
            subscriptions = subscriptions.len(),
            "Customer unit committed"
        );

        Ok(UnitOutcome {
            customer: customer_outcome,
            subscriptions,
            metrics,
        })
    }

    async fn latest_metrics(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<CustomerMetrics>, AppError> {
        MetricsStore::latest(self.db.pool(), stripe_customer_id).await
    }

    async fn metrics_history(
        &self,
        stripe_customer_id: &str,
        limit: i64,
    ) -> Result<Vec<CustomerMetrics>, AppError> {
        MetricsStore::history(self.db.pool(), stripe_customer_id, limit).await
    }

    async fn recompute_daily_analytics(&self, date: NaiveDate) -> Result<DailyAnalytics, AppError> {
        MetricsStore::recompute_daily_analytics(self.db.pool(), date).await
    }

    async fn list_daily_analytics(&self, days: i64) -> Result<Vec<DailyAnalytics>, AppError> {
        MetricsStore::list_daily(self.db.pool(), days).await
    }

    async fn sync_status(&self, since: DateTime<Utc>) -> Result<SyncStatus, AppError> {
        MetricsStore::sync_status(self.db.pool(), since).await
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.db.health_check().await
    }
}
