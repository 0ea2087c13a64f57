//! Drives full and single-customer reconciliation runs.

use crate::config::CustomerSyncConfig;
use crate::models::{CustomerData, SubscriptionData, SyncItemError, SyncStats, WriteOutcome};
use crate::providers::{last_payment_date, BillingProvider, PageParams, ProviderCustomer};
use crate::services::calculator::{self, MetricsContext};
use crate::services::metrics::{record_customer_outcome, record_error, record_sync_run};
use crate::services::repository::{CustomerUnit, SyncRepository, UnitOutcome};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Invoices read per customer when looking for the last payment.
const INVOICE_LOOKUP_LIMIT: u32 = 10;

/// Where a run currently is; emitted as the `phase` field of run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    FetchingPage,
    BatchCheckingExistence,
    ProcessingBatch,
    AggregatingDailyAnalytics,
    Completed,
    FatalError,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchingPage => "fetching_page",
            Self::BatchCheckingExistence => "batch_checking_existence",
            Self::ProcessingBatch => "processing_batch",
            Self::AggregatingDailyAnalytics => "aggregating_daily_analytics",
            Self::Completed => "completed",
            Self::FatalError => "fatal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub page_size: u32,
    pub page_delay: Duration,
    pub batch_size: usize,
    pub batch_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            page_delay: Duration::from_millis(100),
            batch_size: 5,
            batch_delay: Duration::from_millis(50),
        }
    }
}

impl From<&CustomerSyncConfig> for SyncSettings {
    fn from(config: &CustomerSyncConfig) -> Self {
        Self {
            page_size: config.provider.page_size,
            page_delay: config.provider.page_delay,
            batch_size: config.sync.batch_size.max(1),
            batch_delay: config.sync.batch_delay,
        }
    }
}

/// What one customer's unit of work produced.
struct UnitReport {
    customer_id: String,
    result: Result<UnitOutcome, String>,
    subscription_errors: Vec<SyncItemError>,
}

impl UnitReport {
    fn failed(customer_id: &str, error: String, subscription_errors: Vec<SyncItemError>) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            result: Err(error),
            subscription_errors,
        }
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    provider: Arc<dyn BillingProvider>,
    repository: Arc<dyn SyncRepository>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        repository: Arc<dyn SyncRepository>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            provider,
            repository,
            settings,
        }
    }

    pub fn provider(&self) -> &Arc<dyn BillingProvider> {
        &self.provider
    }

    pub fn repository(&self) -> &Arc<dyn SyncRepository> {
        &self.repository
    }

    /// Reconcile every provider customer, then rebuild today's aggregate.
    ///
    /// Only a failure to fetch the customer list is returned as an error;
    /// per-customer failures are recorded in the returned stats.
    #[instrument(skip(self), fields(kind = "full"))]
    pub async fn sync_all_customers(&self) -> Result<SyncStats, AppError> {
        let started = Instant::now();
        let sync_at = Utc::now();
        let mut stats = SyncStats::new();

        info!(phase = SyncPhase::FetchingPage.as_str(), "Starting full customer sync");
        let customers = match self
            .provider
            .get_all_customers(self.settings.page_size, self.settings.page_delay)
            .await
        {
            Ok(customers) => customers,
            Err(e) => {
                error!(
                    phase = SyncPhase::FatalError.as_str(),
                    error = %e,
                    "Failed to fetch customers from provider"
                );
                record_error("provider_fetch");
                record_sync_run("full", "failed", started.elapsed().as_secs_f64());
                return Err(e.into());
            }
        };

        let batch_count = customers.len().div_ceil(self.settings.batch_size);
        for (index, batch) in customers.chunks(self.settings.batch_size).enumerate() {
            self.process_batch(batch, sync_at, &mut stats).await;

            if index + 1 < batch_count && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
        }

        let today = sync_at.date_naive();
        info!(
            phase = SyncPhase::AggregatingDailyAnalytics.as_str(),
            date = %today,
            "Recomputing daily analytics"
        );
        match self.repository.recompute_daily_analytics(today).await {
            Ok(_) => stats.analytics_date = Some(today),
            Err(e) => {
                error!(error = %e, date = %today, "Failed to recompute daily analytics");
                record_error("daily_analytics");
            }
        }

        stats.complete();
        let outcome = if stats.has_errors() {
            "completed_with_errors"
        } else {
            "completed"
        };
        record_sync_run("full", outcome, started.elapsed().as_secs_f64());

        info!(
            phase = SyncPhase::Completed.as_str(),
            customers = customers.len(),
            processed = stats.customers.processed,
            created = stats.customers.created,
            updated = stats.customers.updated,
            customer_errors = stats.customers.errors.len(),
            subscription_errors = stats.subscriptions.errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Full customer sync finished"
        );

        Ok(stats)
    }

    /// Reconcile one customer. Failing to fetch the customer is an error; a
    /// failing unit of work is recorded in the stats like in a full run.
    #[instrument(skip(self), fields(kind = "single"))]
    pub async fn sync_single_customer_by_id(
        &self,
        customer_id: &str,
    ) -> Result<SyncStats, AppError> {
        let started = Instant::now();
        let mut stats = SyncStats::new();

        let customer = match self.provider.get_customer(customer_id).await {
            Ok(customer) => customer,
            Err(e) => {
                warn!(
                    phase = SyncPhase::FatalError.as_str(),
                    error = %e,
                    "Failed to fetch customer from provider"
                );
                record_error("provider_fetch");
                record_sync_run("single", "failed", started.elapsed().as_secs_f64());
                return Err(e.into());
            }
        };

        let report = self.process_customer(&customer, None, Utc::now()).await;
        merge_report(&mut stats, report);

        stats.complete();
        let outcome = if stats.has_errors() {
            "completed_with_errors"
        } else {
            "completed"
        };
        record_sync_run("single", outcome, started.elapsed().as_secs_f64());
        info!(
            phase = SyncPhase::Completed.as_str(),
            processed = stats.customers.processed,
            errors = stats.customers.errors.len(),
            "Single customer sync finished"
        );

        Ok(stats)
    }

    /// One existence query for the batch, then every unit concurrently. If the
    /// pre-check fails the batch runs sequentially with per-customer lookups.
    async fn process_batch(
        &self,
        batch: &[ProviderCustomer],
        sync_at: DateTime<Utc>,
        stats: &mut SyncStats,
    ) {
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        debug!(
            phase = SyncPhase::BatchCheckingExistence.as_str(),
            batch_size = ids.len(),
            "Checking which customers exist"
        );

        match self.repository.existing_customer_ids(&ids).await {
            Ok(existing) => {
                let (known, new) = partition_existing(batch, &existing);
                debug!(
                    phase = SyncPhase::ProcessingBatch.as_str(),
                    existing = known.len(),
                    new = new.len(),
                    "Processing batch"
                );
                let units = batch.iter().map(|customer| {
                    let known = existing.contains(&customer.id);
                    self.process_customer(customer, Some(known), sync_at)
                });
                for report in futures::future::join_all(units).await {
                    merge_report(stats, report);
                }
            }
            Err(e) => {
                warn!(
                    phase = SyncPhase::ProcessingBatch.as_str(),
                    error = %e,
                    "Batch existence check failed, processing sequentially"
                );
                record_error("existence_check");
                for customer in batch {
                    let report = self.process_customer(customer, None, sync_at).await;
                    merge_report(stats, report);
                }
            }
        }
    }

    /// Fetch, compute and write one customer. Provider reads happen before
    /// the write transaction opens, so a failed fetch writes nothing.
    #[instrument(skip(self, customer, sync_at), fields(customer_id = %customer.id))]
    async fn process_customer(
        &self,
        customer: &ProviderCustomer,
        known_exists: Option<bool>,
        sync_at: DateTime<Utc>,
    ) -> UnitReport {
        let provider_subscriptions = match self.provider.list_subscriptions(&customer.id).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(error = %e, "Failed to list subscriptions");
                return UnitReport::failed(
                    &customer.id,
                    format!("Failed to list subscriptions: {}", e),
                    Vec::new(),
                );
            }
        };

        let mut subscriptions: Vec<SubscriptionData> = Vec::with_capacity(provider_subscriptions.len());
        let mut subscription_errors = Vec::new();
        for provider_subscription in &provider_subscriptions {
            match SubscriptionData::try_from(provider_subscription) {
                Ok(data) if data.stripe_customer_id != customer.id => {
                    subscription_errors.push(SyncItemError::subscription(
                        &customer.id,
                        &data.stripe_subscription_id,
                        format!("Subscription belongs to customer {}", data.stripe_customer_id),
                    ));
                }
                Ok(data) => subscriptions.push(data),
                Err(e) => {
                    warn!(subscription_id = %provider_subscription.id, error = %e, "Skipping invalid subscription");
                    subscription_errors.push(SyncItemError::subscription(
                        &customer.id,
                        &provider_subscription.id,
                        e.to_string(),
                    ));
                }
            }
        }

        let last_payment = match self
            .provider
            .list_invoices(&customer.id, &PageParams::first(INVOICE_LOOKUP_LIMIT))
            .await
        {
            Ok(page) => last_payment_date(&page.data),
            Err(e) => {
                debug!(error = %e, "Invoice lookup failed, leaving last payment date empty");
                None
            }
        };

        let customer_data = CustomerData::from(customer);
        let metrics = calculator::calculate(
            &customer.id,
            &subscriptions,
            MetricsContext {
                delinquent: customer_data.delinquent,
                last_payment_date: last_payment,
                metric_date: sync_at.date_naive(),
            },
        );

        let unit = CustomerUnit {
            customer: customer_data,
            subscriptions,
            metrics,
            sync_at,
        };

        match self.repository.apply_customer_unit(&unit, known_exists).await {
            Ok(outcome) => UnitReport {
                customer_id: customer.id.clone(),
                result: Ok(outcome),
                subscription_errors,
            },
            Err(e) => {
                error!(error = %e, "Customer unit rolled back");
                UnitReport::failed(&customer.id, e.to_string(), subscription_errors)
            }
        }
    }
}

fn merge_report(stats: &mut SyncStats, report: UnitReport) {
    stats.subscriptions.errors.extend(report.subscription_errors);

    match report.result {
        Ok(outcome) => {
            stats.customers.record(outcome.customer);
            for (_, subscription_outcome) in outcome.subscriptions {
                stats.subscriptions.record(subscription_outcome);
            }
            stats.metrics_calculated += 1;
            record_customer_outcome(match outcome.customer {
                WriteOutcome::Created => "created",
                WriteOutcome::Updated => "updated",
            });
        }
        Err(error) => {
            record_customer_outcome("failed");
            record_error("customer_unit");
            stats
                .customers
                .errors
                .push(SyncItemError::customer(report.customer_id, error));
        }
    }
}

/// Ids in `customers` that `existing` reports as already stored.
pub fn partition_existing<'a>(
    customers: &'a [ProviderCustomer],
    existing: &HashSet<String>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    customers
        .iter()
        .map(|c| c.id.as_str())
        .partition(|id| existing.contains(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubscriptionStatus;
    use crate::providers::{MockBillingProvider, ProviderError};
    use crate::services::memory::MemoryRepository;

    fn settings() -> SyncSettings {
        SyncSettings {
            page_size: 2,
            page_delay: Duration::ZERO,
            batch_size: 2,
            batch_delay: Duration::ZERO,
        }
    }

    fn orchestrator(
        provider: Arc<MockBillingProvider>,
        repository: Arc<MemoryRepository>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(provider, repository, settings())
    }

    fn provider_with(ids: &[&str]) -> Arc<MockBillingProvider> {
        let provider = Arc::new(MockBillingProvider::new());
        for (i, id) in ids.iter().enumerate() {
            provider.add_customer(
                MockBillingProvider::customer(id),
                vec![MockBillingProvider::subscription(
                    &format!("sub_{}", i),
                    id,
                    "price_456",
                    10_000,
                    SubscriptionStatus::Active,
                )],
            );
        }
        provider
    }

    #[tokio::test]
    async fn test_end_to_end_single_customer() {
        let provider = provider_with(&["cus_123"]);
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_all_customers().await.unwrap();

        assert_eq!(stats.customers.processed, 1);
        assert_eq!(stats.customers.created, 1);
        assert_eq!(stats.subscriptions.created, 1);
        assert_eq!(stats.metrics_calculated, 1);
        assert!(!stats.has_errors());

        let customer = repository.customer("cus_123").expect("customer stored");
        assert_eq!(customer.data.stripe_customer_id, "cus_123");

        let subscription = repository.subscription("sub_0").expect("subscription stored");
        assert_eq!(subscription.data.stripe_customer_id, "cus_123");
        assert_eq!(subscription.data.stripe_price_id, "price_456");
        assert_eq!(subscription.data.status, SubscriptionStatus::Active);

        let today = stats.analytics_date.expect("analytics recomputed");
        let metrics = repository.metrics_for("cus_123", today).expect("metrics stored");
        assert_eq!(metrics.active_subscription_count, 1);
        assert_eq!(metrics.total_revenue, 10_000);
        assert_eq!(metrics.lifetime_value, 240_000);
        assert_eq!(metrics.health_score, 85);
        assert_eq!(metrics.churn_risk_score, 0.1);
    }

    #[tokio::test]
    async fn test_single_customer_sync_is_idempotent() {
        let provider = provider_with(&["cus_123"]);
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let first = sync.sync_single_customer_by_id("cus_123").await.unwrap();
        assert_eq!(first.customers.created, 1);
        assert_eq!(first.customers.updated, 0);
        let stored_first = repository.customer("cus_123").unwrap();
        let subscription_first = repository.subscription("sub_0").unwrap();

        let second = sync.sync_single_customer_by_id("cus_123").await.unwrap();
        assert_eq!(second.customers.created, 0);
        assert_eq!(second.customers.updated, 1);
        assert_eq!(second.subscriptions.updated, 1);

        let stored_second = repository.customer("cus_123").unwrap();
        assert_eq!(stored_first.customer_id, stored_second.customer_id);
        assert_eq!(stored_first.data, stored_second.data);
        assert!(stored_second.last_sync_at >= stored_first.last_sync_at);
        assert_eq!(
            subscription_first.data,
            repository.subscription("sub_0").unwrap().data
        );
        assert_eq!(repository.customer_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let ids = ["cus_1", "cus_2", "cus_3", "cus_4", "cus_5"];
        let provider = provider_with(&ids);
        provider.fail_subscriptions_for("cus_3");
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_all_customers().await.unwrap();

        assert_eq!(stats.customers.processed, 4);
        assert_eq!(stats.customers.attempted(), 5);
        assert_eq!(stats.customers.errors.len(), 1);
        assert_eq!(stats.customers.errors[0].customer_id.as_deref(), Some("cus_3"));
        for id in ["cus_1", "cus_2", "cus_4", "cus_5"] {
            assert!(repository.customer(id).is_some(), "{} persisted", id);
        }
        assert!(repository.customer("cus_3").is_none());
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_the_whole_unit() {
        let provider = provider_with(&["cus_1", "cus_2"]);
        let repository = Arc::new(MemoryRepository::new());
        repository.fail_writes_for("cus_2");
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_all_customers().await.unwrap();

        assert_eq!(stats.customers.processed, 1);
        assert_eq!(stats.subscriptions.processed, 1);
        assert!(repository.customer("cus_2").is_none());
        assert!(repository.subscription("sub_1").is_none());
    }

    #[tokio::test]
    async fn test_provider_unreachable_is_fatal() {
        let provider = provider_with(&["cus_1"]);
        provider.fail_next_calls(1, ProviderError::Network("connection refused".to_string()));
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let result = sync.sync_all_customers().await;

        assert!(matches!(result, Err(AppError::BadGateway(_))));
        assert_eq!(repository.customer_count(), 0);
        assert_eq!(repository.analytics_row_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_single_customer_is_not_found() {
        let provider = provider_with(&[]);
        let sync = orchestrator(provider, Arc::new(MemoryRepository::new()));

        let result = sync.sync_single_customer_by_id("cus_missing").await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_existence_check_runs_once_per_batch() {
        let provider = provider_with(&["cus_1", "cus_2", "cus_3", "cus_4", "cus_5"]);
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        sync.sync_all_customers().await.unwrap();

        // Batches of two: [1, 2], [3, 4], [5].
        assert_eq!(repository.existence_check_count(), 3);
    }

    #[tokio::test]
    async fn test_existence_check_failure_falls_back_to_sequential() {
        let provider = provider_with(&["cus_1", "cus_2", "cus_3"]);
        let repository = Arc::new(MemoryRepository::new());
        repository.fail_existence_checks(true);
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_all_customers().await.unwrap();

        assert_eq!(stats.customers.processed, 3);
        assert_eq!(stats.customers.created, 3);
        assert!(!stats.has_errors());
    }

    #[tokio::test]
    async fn test_second_full_run_updates_everything() {
        let provider = provider_with(&["cus_1", "cus_2", "cus_3"]);
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        sync.sync_all_customers().await.unwrap();
        let second = sync.sync_all_customers().await.unwrap();

        assert_eq!(second.customers.created, 0);
        assert_eq!(second.customers.updated, 3);
        assert_eq!(repository.analytics_row_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_subscription_is_recorded_and_skipped() {
        let provider = Arc::new(MockBillingProvider::new());
        let mut broken = MockBillingProvider::subscription(
            "sub_broken",
            "cus_1",
            "price_1",
            500,
            SubscriptionStatus::Active,
        );
        broken.items.data.clear();
        provider.add_customer(
            MockBillingProvider::customer("cus_1"),
            vec![
                broken,
                MockBillingProvider::subscription(
                    "sub_ok",
                    "cus_1",
                    "price_1",
                    500,
                    SubscriptionStatus::Active,
                ),
            ],
        );
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_single_customer_by_id("cus_1").await.unwrap();

        assert_eq!(stats.customers.processed, 1);
        assert_eq!(stats.subscriptions.processed, 1);
        assert_eq!(stats.subscriptions.errors.len(), 1);
        assert_eq!(
            stats.subscriptions.errors[0].subscription_id.as_deref(),
            Some("sub_broken")
        );
        assert!(repository.subscription("sub_broken").is_none());
    }

    #[tokio::test]
    async fn test_unknown_status_skips_only_that_subscription() {
        let provider = Arc::new(MockBillingProvider::new());
        let mut unknown = MockBillingProvider::subscription(
            "sub_new_status",
            "cus_1",
            "price_1",
            500,
            SubscriptionStatus::Active,
        );
        unknown.status = "some_new_status".to_string();
        provider.add_customer(
            MockBillingProvider::customer("cus_1"),
            vec![
                unknown,
                MockBillingProvider::subscription(
                    "sub_ok",
                    "cus_1",
                    "price_1",
                    500,
                    SubscriptionStatus::Active,
                ),
            ],
        );
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_single_customer_by_id("cus_1").await.unwrap();

        assert_eq!(stats.customers.processed, 1);
        assert!(stats.customers.errors.is_empty());
        assert_eq!(stats.subscriptions.errors.len(), 1);
        assert_eq!(
            stats.subscriptions.errors[0].subscription_id.as_deref(),
            Some("sub_new_status")
        );
        assert!(repository.subscription("sub_ok").is_some());
        assert!(repository.subscription("sub_new_status").is_none());
    }

    #[tokio::test]
    async fn test_last_payment_date_comes_from_invoices() {
        let provider = provider_with(&["cus_1"]);
        // 2024-05-15T12:00:00Z
        provider.add_invoice("cus_1", MockBillingProvider::paid_invoice("in_1", 10_000, 1_715_774_400));
        let repository = Arc::new(MemoryRepository::new());
        let sync = orchestrator(provider, repository.clone());

        let stats = sync.sync_single_customer_by_id("cus_1").await.unwrap();
        assert!(!stats.has_errors());

        let metrics = repository
            .latest_metrics("cus_1")
            .await
            .unwrap()
            .expect("metrics stored");
        assert_eq!(
            metrics.last_payment_date,
            chrono::NaiveDate::from_ymd_opt(2024, 5, 15)
        );
    }

    #[tokio::test]
    async fn test_partition_existing_matches_direct_lookups() {
        let customers: Vec<ProviderCustomer> = ["cus_a", "cus_b", "cus_c", "cus_d"]
            .iter()
            .map(|id| MockBillingProvider::customer(id))
            .collect();
        let repository = MemoryRepository::new();
        for id in ["cus_b", "cus_d"] {
            let provider = provider_with(&[id]);
            let sync = orchestrator(provider, Arc::new(MemoryRepository::new()));
            sync.sync_single_customer_by_id(id).await.unwrap();
            let stored = sync.repository().find_customer(id).await.unwrap().unwrap();
            repository.seed_customer(stored);
        }

        let ids: Vec<String> = customers.iter().map(|c| c.id.clone()).collect();
        let existing = repository.existing_customer_ids(&ids).await.unwrap();
        let (known, new) = partition_existing(&customers, &existing);

        for id in &known {
            assert!(repository.find_customer(id).await.unwrap().is_some());
        }
        for id in &new {
            assert!(repository.find_customer(id).await.unwrap().is_none());
        }
        assert_eq!(known, vec!["cus_b", "cus_d"]);
        assert_eq!(new, vec!["cus_a", "cus_c"]);
    }
}
