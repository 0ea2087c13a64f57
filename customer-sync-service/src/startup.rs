//! Application startup and lifecycle management.

use crate::config::CustomerSyncConfig;
use crate::handlers::{
    get_customer, get_customer_billing, get_customer_metrics, health_check,
    list_daily_analytics, metrics_endpoint, readiness_check, recompute_daily_analytics,
    sync_status, trigger_sync,
};
use crate::providers::{BillingProvider, RetryingProvider, StripeProvider};
use crate::services::{
    init_metrics, Database, PgSyncRepository, SyncOrchestrator, SyncRepository, SyncSettings,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Invoices returned by the billing read-through endpoint.
const DEFAULT_INVOICE_PAGE_SIZE: u32 = 20;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SyncOrchestrator,
    /// Window for counting "recently synced" customers.
    pub recent_window: chrono::Duration,
    pub invoice_page_size: u32,
}

impl AppState {
    pub fn new(
        provider: Arc<dyn BillingProvider>,
        repository: Arc<dyn SyncRepository>,
        settings: SyncSettings,
        recent_window: chrono::Duration,
    ) -> Self {
        Self {
            orchestrator: SyncOrchestrator::new(provider, repository, settings),
            recent_window,
            invoice_page_size: DEFAULT_INVOICE_PAGE_SIZE,
        }
    }
}

/// Every HTTP route of the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/customers/sync", post(trigger_sync))
        .route("/customers/sync/status", get(sync_status))
        .route("/customers/:id", get(get_customer))
        .route("/customers/:id/metrics", get(get_customer_metrics))
        .route("/customers/:id/billing", get(get_customer_billing))
        .route("/analytics/daily", get(list_daily_analytics))
        .route("/analytics/daily/recompute", post(recompute_daily_analytics))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    db: Database,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: CustomerSyncConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: CustomerSyncConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: CustomerSyncConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let stripe = StripeProvider::new(config.provider.clone()).map_err(|e| {
            tracing::error!(error = %e, "Failed to create billing provider client");
            AppError::from(e)
        })?;
        let provider: Arc<dyn BillingProvider> = Arc::new(RetryingProvider::new(
            stripe,
            config.provider.retry_config(),
        ));
        tracing::info!(
            api_base = %config.provider.api_base,
            max_retries = config.provider.max_retries,
            "Billing provider initialized"
        );

        let repository: Arc<dyn SyncRepository> = Arc::new(PgSyncRepository::new(db.clone()));
        let state = AppState::new(
            provider,
            repository,
            SyncSettings::from(&config),
            config.sync.recent_window,
        );

        let addr = config.common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Customer sync service listener bound");

        Ok(Self {
            port,
            listener,
            state,
            db,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let app = router(self.state);
        axum::serve(self.listener, app).await.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
