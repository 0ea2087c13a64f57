//! In-memory `SyncRepository` for tests and local runs without Postgres.
//!
//! A unit is staged against a copy of the affected rows and only published
//! when every step succeeded, matching the transactional behaviour of the
//! Postgres repository.

use crate::models::{
    Customer, CustomerMetrics, DailyAnalytics, Subscription, SubscriptionStatus, SyncStatus,
    WriteOutcome,
};
use crate::services::repository::{CustomerUnit, SyncRepository, UnitOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    customers: HashMap<String, Customer>,
    subscriptions: HashMap<String, Subscription>,
    metrics: BTreeMap<(String, NaiveDate), CustomerMetrics>,
    analytics: BTreeMap<NaiveDate, DailyAnalytics>,
    failing_writes: HashSet<String>,
    fail_existence_checks: bool,
    existence_checks: u64,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every unit for this customer fail before anything is published.
    pub fn fail_writes_for(&self, stripe_customer_id: &str) {
        self.lock()
            .failing_writes
            .insert(stripe_customer_id.to_string());
    }

    pub fn fail_existence_checks(&self, fail: bool) {
        self.lock().fail_existence_checks = fail;
    }

    pub fn existence_check_count(&self) -> u64 {
        self.lock().existence_checks
    }

    pub fn customer(&self, stripe_customer_id: &str) -> Option<Customer> {
        self.lock().customers.get(stripe_customer_id).cloned()
    }

    pub fn subscription(&self, stripe_subscription_id: &str) -> Option<Subscription> {
        self.lock().subscriptions.get(stripe_subscription_id).cloned()
    }

    pub fn metrics_for(&self, stripe_customer_id: &str, date: NaiveDate) -> Option<CustomerMetrics> {
        self.lock()
            .metrics
            .get(&(stripe_customer_id.to_string(), date))
            .cloned()
    }

    pub fn customer_count(&self) -> usize {
        self.lock().customers.len()
    }

    pub fn analytics_row_count(&self) -> usize {
        self.lock().analytics.len()
    }

    /// Insert a customer row directly, as another writer would.
    pub fn seed_customer(&self, customer: Customer) {
        self.lock()
            .customers
            .insert(customer.data.stripe_customer_id.clone(), customer);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn date_of(ts: Option<DateTime<Utc>>) -> Option<NaiveDate> {
    ts.map(|t| t.date_naive())
}

#[async_trait]
impl SyncRepository for MemoryRepository {
    async fn existing_customer_ids(&self, ids: &[String]) -> Result<HashSet<String>, AppError> {
        let mut state = self.lock();
        state.existence_checks += 1;
        if state.fail_existence_checks {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to check customer existence: connection reset"
            )));
        }
        Ok(ids
            .iter()
            .filter(|id| state.customers.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn find_customer(&self, stripe_customer_id: &str) -> Result<Option<Customer>, AppError> {
        Ok(self.customer(stripe_customer_id))
    }

    async fn list_subscriptions(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.lock();
        let mut subscriptions: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.data.stripe_customer_id == stripe_customer_id)
            .cloned()
            .collect();
        subscriptions.sort_by(|a, b| {
            b.data
                .provider_created_at
                .cmp(&a.data.provider_created_at)
                .then_with(|| a.data.stripe_subscription_id.cmp(&b.data.stripe_subscription_id))
        });
        Ok(subscriptions)
    }

    async fn apply_customer_unit(
        &self,
        unit: &CustomerUnit,
        known_exists: Option<bool>,
    ) -> Result<UnitOutcome, AppError> {
        let mut state = self.lock();
        let id = unit.customer.stripe_customer_id.clone();
        let now = Utc::now();

        if state.failing_writes.contains(&id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to save customer {}: injected failure",
                id
            )));
        }

        let existing = state.customers.get(&id).cloned();
        let exists = known_exists.unwrap_or(existing.is_some());

        let (customer, customer_outcome) = match (exists, existing) {
            (true, Some(current)) => (
                Customer {
                    customer_id: current.customer_id,
                    data: unit.customer.clone(),
                    last_sync_at: current.last_sync_at.max(unit.sync_at),
                    created_utc: current.created_utc,
                    updated_utc: now,
                },
                WriteOutcome::Updated,
            ),
            (true, None) => {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Customer {} vanished before update",
                    id
                )))
            }
            (false, Some(_)) => {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create customer: duplicate key value violates unique constraint \
                     \"customers_stripe_customer_id_key\""
                )))
            }
            (false, None) => (
                Customer {
                    customer_id: Uuid::new_v4(),
                    data: unit.customer.clone(),
                    last_sync_at: unit.sync_at,
                    created_utc: now,
                    updated_utc: now,
                },
                WriteOutcome::Created,
            ),
        };

        let mut staged = Vec::with_capacity(unit.subscriptions.len());
        let mut outcomes = Vec::with_capacity(unit.subscriptions.len());
        for data in &unit.subscriptions {
            if data.stripe_customer_id != id && !state.customers.contains_key(&data.stripe_customer_id)
            {
                return Err(AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create subscription: customer {} does not exist",
                    data.stripe_customer_id
                )));
            }
            let (subscription, outcome) = match state.subscriptions.get(&data.stripe_subscription_id) {
                Some(current) => (
                    Subscription {
                        subscription_id: current.subscription_id,
                        data: data.clone(),
                        created_utc: current.created_utc,
                        updated_utc: now,
                    },
                    WriteOutcome::Updated,
                ),
                None => (
                    Subscription {
                        subscription_id: Uuid::new_v4(),
                        data: data.clone(),
                        created_utc: now,
                        updated_utc: now,
                    },
                    WriteOutcome::Created,
                ),
            };
            outcomes.push((data.stripe_subscription_id.clone(), outcome));
            staged.push(subscription);
        }

        if !(0..=100).contains(&unit.metrics.health_score)
            || !(0.0..=1.0).contains(&unit.metrics.churn_risk_score)
        {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to upsert customer metrics: check constraint violated"
            )));
        }

        state.customers.insert(id.clone(), customer);
        for subscription in staged {
            state
                .subscriptions
                .insert(subscription.data.stripe_subscription_id.clone(), subscription);
        }
        state
            .metrics
            .insert((id, unit.metrics.metric_date), unit.metrics.clone());

        Ok(UnitOutcome {
            customer: customer_outcome,
            subscriptions: outcomes,
            metrics: unit.metrics.clone(),
        })
    }

    async fn latest_metrics(
        &self,
        stripe_customer_id: &str,
    ) -> Result<Option<CustomerMetrics>, AppError> {
        Ok(self
            .metrics_history(stripe_customer_id, 1)
            .await?
            .into_iter()
            .next())
    }

    async fn metrics_history(
        &self,
        stripe_customer_id: &str,
        limit: i64,
    ) -> Result<Vec<CustomerMetrics>, AppError> {
        let state = self.lock();
        Ok(state
            .metrics
            .values()
            .rev()
            .filter(|m| m.stripe_customer_id == stripe_customer_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn recompute_daily_analytics(&self, date: NaiveDate) -> Result<DailyAnalytics, AppError> {
        let mut state = self.lock();

        let active_customers: HashSet<&str> = state
            .subscriptions
            .values()
            .filter(|s| s.data.status == SubscriptionStatus::Active)
            .map(|s| s.data.stripe_customer_id.as_str())
            .collect();

        let new_customers = state
            .customers
            .values()
            .filter(|c| date_of(c.data.provider_created_at) == Some(date))
            .count();

        let churned: HashSet<&str> = state
            .subscriptions
            .values()
            .filter(|s| date_of(s.data.canceled_at) == Some(date))
            .map(|s| s.data.stripe_customer_id.as_str())
            .filter(|id| !active_customers.contains(id))
            .collect();

        let total_revenue: i64 = state
            .metrics
            .values()
            .filter(|m| m.metric_date == date)
            .map(|m| m.total_revenue)
            .sum();

        let new_subscriptions = state
            .subscriptions
            .values()
            .filter(|s| date_of(s.data.provider_created_at) == Some(date))
            .count();
        let canceled_subscriptions = state
            .subscriptions
            .values()
            .filter(|s| date_of(s.data.canceled_at) == Some(date))
            .count();

        let total_active_customers = active_customers.len() as i32;
        let row = DailyAnalytics {
            date,
            new_customers: new_customers as i32,
            churned_customers: churned.len() as i32,
            total_active_customers,
            total_revenue,
            average_revenue_per_customer: DailyAnalytics::average_revenue(
                total_revenue,
                total_active_customers,
            ),
            new_subscriptions: new_subscriptions as i32,
            canceled_subscriptions: canceled_subscriptions as i32,
        };

        state.analytics.insert(date, row.clone());
        Ok(row)
    }

    async fn list_daily_analytics(&self, days: i64) -> Result<Vec<DailyAnalytics>, AppError> {
        let state = self.lock();
        Ok(state
            .analytics
            .values()
            .rev()
            .take(days.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn sync_status(&self, since: DateTime<Utc>) -> Result<SyncStatus, AppError> {
        let state = self.lock();
        let total_customers = state.customers.len() as i64;
        let recently_synced = state
            .customers
            .values()
            .filter(|c| c.last_sync_at >= since)
            .count() as i64;

        Ok(SyncStatus {
            last_sync: state.customers.values().map(|c| c.last_sync_at).max(),
            total_customers,
            recently_synced,
            total_subscriptions: state.subscriptions.len() as i64,
            active_subscriptions: state
                .subscriptions
                .values()
                .filter(|s| s.data.status.is_active())
                .count() as i64,
            sync_health: SyncStatus::health_ratio(recently_synced, total_customers),
        })
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
