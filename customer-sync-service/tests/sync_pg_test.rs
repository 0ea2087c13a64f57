//! Postgres-backed sync tests. Set `TEST_DATABASE_URL` to run them; without
//! it every test returns early.

mod common;

use chrono::Utc;
use common::{fast_settings, pg_repository};
use customer_sync_service::models::SubscriptionStatus;
use customer_sync_service::providers::MockBillingProvider;
use customer_sync_service::services::{
    CustomerStore, MetricsStore, PgSyncRepository, SubscriptionStore, SyncOrchestrator,
    SyncRepository,
};
use serial_test::serial;
use std::sync::Arc;

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

fn orchestrator(provider: Arc<MockBillingProvider>, repository: &PgSyncRepository) -> SyncOrchestrator {
    SyncOrchestrator::new(provider, Arc::new(repository.clone()), fast_settings())
}

#[tokio::test]
#[serial]
async fn end_to_end_sync_persists_customer_subscription_and_metrics() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let sync = orchestrator(provider_with(&["cus_123"]), &repository);

    let stats = sync.sync_all_customers().await.unwrap();
    assert_eq!(stats.customers.created, 1);
    assert!(!stats.has_errors());

    let pool = repository.database().pool();
    let customer = CustomerStore::find_by_provider_id(pool, "cus_123")
        .await
        .unwrap()
        .expect("customer row");
    assert_eq!(customer.data.stripe_customer_id, "cus_123");

    let subscription = SubscriptionStore::find_by_provider_id(pool, "sub_0")
        .await
        .unwrap()
        .expect("subscription row");
    assert_eq!(subscription.data.stripe_customer_id, "cus_123");
    assert_eq!(subscription.data.stripe_price_id, "price_456");
    assert_eq!(subscription.data.status, SubscriptionStatus::Active);

    let metrics = MetricsStore::latest(pool, "cus_123")
        .await
        .unwrap()
        .expect("metrics row");
    assert_eq!(metrics.metric_date, Utc::now().date_naive());
    assert_eq!(metrics.active_subscription_count, 1);
    assert_eq!(metrics.total_revenue, 10_000);
    assert_eq!(metrics.lifetime_value, 240_000);
    assert_eq!(metrics.health_score, 85);
    assert_eq!(metrics.churn_risk_score, 0.1);
}

#[tokio::test]
#[serial]
async fn repeated_single_sync_updates_in_place() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let sync = orchestrator(provider_with(&["cus_1"]), &repository);

    let first = sync.sync_single_customer_by_id("cus_1").await.unwrap();
    let before = repository.find_customer("cus_1").await.unwrap().unwrap();
    let second = sync.sync_single_customer_by_id("cus_1").await.unwrap();
    let after = repository.find_customer("cus_1").await.unwrap().unwrap();

    assert_eq!((first.customers.created, first.customers.updated), (1, 0));
    assert_eq!((second.customers.created, second.customers.updated), (0, 1));
    assert_eq!(second.subscriptions.updated, 1);
    assert_eq!(before.customer_id, after.customer_id);
    assert_eq!(before.data, after.data);
    assert!(after.last_sync_at >= before.last_sync_at);

    let history = repository.metrics_history("cus_1", 10).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
#[serial]
async fn last_sync_at_never_moves_backwards() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let sync = orchestrator(provider_with(&["cus_1"]), &repository);
    sync.sync_single_customer_by_id("cus_1").await.unwrap();
    let current = repository.find_customer("cus_1").await.unwrap().unwrap();

    let stale = current.last_sync_at - chrono::Duration::hours(1);
    let updated = CustomerStore::update(repository.database().pool(), &current.data, stale)
        .await
        .unwrap();

    assert_eq!(updated.last_sync_at, current.last_sync_at);
}

#[tokio::test]
#[serial]
async fn failed_unit_leaves_no_rows() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let provider = provider_with(&["cus_1", "cus_2", "cus_3", "cus_4", "cus_5"]);
    provider.fail_subscriptions_for("cus_3");
    let sync = orchestrator(provider, &repository);

    let stats = sync.sync_all_customers().await.unwrap();

    assert_eq!(stats.customers.processed, 4);
    assert_eq!(stats.customers.errors[0].customer_id.as_deref(), Some("cus_3"));
    assert!(repository.find_customer("cus_3").await.unwrap().is_none());
    for id in ["cus_1", "cus_2", "cus_4", "cus_5"] {
        assert!(repository.find_customer(id).await.unwrap().is_some());
    }
}

#[tokio::test]
#[serial]
async fn existence_check_partitions_known_and_new() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let sync = orchestrator(provider_with(&["cus_a", "cus_c"]), &repository);
    sync.sync_all_customers().await.unwrap();

    let ids: Vec<String> = ["cus_a", "cus_b", "cus_c", "cus_d"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let existing = repository.existing_customer_ids(&ids).await.unwrap();

    for id in &ids {
        let direct = repository.find_customer(id).await.unwrap().is_some();
        assert_eq!(existing.contains(id), direct, "{}", id);
    }
    assert_eq!(existing.len(), 2);
    assert!(repository.existing_customer_ids(&[]).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn daily_recompute_replaces_the_row() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let provider = provider_with(&["cus_1", "cus_2"]);
    let sync = orchestrator(provider.clone(), &repository);
    sync.sync_all_customers().await.unwrap();
    let today = Utc::now().date_naive();

    let first = repository.recompute_daily_analytics(today).await.unwrap();
    assert_eq!(first.total_active_customers, 2);
    assert_eq!(first.total_revenue, 20_000);

    provider.add_customer(
        MockBillingProvider::customer("cus_3"),
        vec![MockBillingProvider::subscription(
            "sub_3",
            "cus_3",
            "price_456",
            10_000,
            SubscriptionStatus::Active,
        )],
    );
    sync.sync_single_customer_by_id("cus_3").await.unwrap();

    let second = repository.recompute_daily_analytics(today).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(second.total_active_customers, 3);
    assert_eq!(second.new_customers, 3);
    assert_eq!(second.new_subscriptions, 3);
    assert_eq!(second.total_revenue, 30_000);
    assert_eq!(second.average_revenue_per_customer, 10_000);

    let rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM customer_analytics_daily WHERE date = $1",
    )
    .bind(today)
    .fetch_one(repository.database().pool())
    .await
    .unwrap();
    assert_eq!(rows, 1);

    let stored = repository.list_daily_analytics(7).await.unwrap();
    assert_eq!(stored, vec![second]);
}

#[tokio::test]
#[serial]
async fn sync_status_counts_recent_customers() {
    let Some(repository) = pg_repository().await else {
        return;
    };
    let sync = orchestrator(provider_with(&["cus_1", "cus_2", "cus_3"]), &repository);
    sync.sync_all_customers().await.unwrap();

    let status = repository
        .sync_status(Utc::now() - chrono::Duration::hours(24))
        .await
        .unwrap();

    assert_eq!(status.total_customers, 3);
    assert_eq!(status.recently_synced, 3);
    assert_eq!(status.active_subscriptions, 3);
    assert_eq!(status.sync_health, 1.0);
}
