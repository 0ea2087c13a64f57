//! Common test utilities for customer-sync-service integration tests.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use customer_sync_service::providers::MockBillingProvider;
use customer_sync_service::services::{Database, MemoryRepository, PgSyncRepository, SyncSettings};
use customer_sync_service::startup::{router, AppState};
use http_body_util::BodyExt;
use std::sync::{Arc, Once};
use std::time::Duration;
use tower::util::ServiceExt;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,customer_sync_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Settings without pauses so tests run fast.
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        page_size: 2,
        page_delay: Duration::ZERO,
        batch_size: 2,
        batch_delay: Duration::ZERO,
    }
}

/// Router backed by the mock provider and the in-memory repository.
#[allow(dead_code)]
pub fn memory_app(provider: Arc<MockBillingProvider>, repository: Arc<MemoryRepository>) -> Router {
    init_tracing();
    let state = AppState::new(
        provider,
        repository,
        fast_settings(),
        chrono::Duration::hours(24),
    );
    router(state)
}

/// Send one request through the router and decode the JSON body (`Null` if empty).
#[allow(dead_code)]
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

/// Postgres repository on a clean schema, or `None` when `TEST_DATABASE_URL`
/// is not set.
#[allow(dead_code)]
pub async fn pg_repository() -> Option<PgSyncRepository> {
    let database_url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set, skipping Postgres test");
            return None;
        }
    };
    init_tracing();

    let db = Database::new(&database_url, 4, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    sqlx::query(
        "TRUNCATE customer_metrics, customer_subscriptions, customers, customer_analytics_daily",
    )
    .execute(db.pool())
    .await
    .expect("Failed to clean test tables");

    Some(PgSyncRepository::new(db))
}
