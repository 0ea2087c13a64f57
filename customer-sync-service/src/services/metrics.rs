//! Prometheus metrics for customer-sync-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "customer_sync_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for billing provider requests by operation and outcome.
pub static PROVIDER_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "customer_sync_provider_requests_total",
        "Total number of billing provider requests",
        &["operation", "outcome"]
    )
    .expect("Failed to register PROVIDER_REQUESTS")
});

/// Counter for sync runs by kind (full/single) and outcome.
pub static SYNC_RUNS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "customer_sync_runs_total",
        "Total number of sync runs",
        &["kind", "outcome"]
    )
    .expect("Failed to register SYNC_RUNS")
});

/// Histogram for sync run duration.
pub static SYNC_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "customer_sync_run_duration_seconds",
        "Sync run duration in seconds",
        &["kind"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    )
    .expect("Failed to register SYNC_DURATION")
});

/// Counter for customer units of work by outcome (created/updated/failed).
pub static CUSTOMERS_SYNCED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "customer_sync_customers_total",
        "Total number of customer units of work",
        &["outcome"]
    )
    .expect("Failed to register CUSTOMERS_SYNCED")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "customer_sync_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PROVIDER_REQUESTS);
    Lazy::force(&SYNC_RUNS);
    Lazy::force(&SYNC_DURATION);
    Lazy::force(&CUSTOMERS_SYNCED);
    Lazy::force(&ERRORS);
    Lazy::force(&service_core::middleware::metrics::HTTP_REQUESTS);
    Lazy::force(&service_core::middleware::metrics::HTTP_REQUEST_DURATION);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a billing provider request.
pub fn record_provider_request(operation: &str, outcome: &str) {
    PROVIDER_REQUESTS
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Record a finished sync run.
pub fn record_sync_run(kind: &str, outcome: &str, duration_secs: f64) {
    SYNC_RUNS.with_label_values(&[kind, outcome]).inc();
    SYNC_DURATION.with_label_values(&[kind]).observe(duration_secs);
}

/// Record the outcome of one customer unit of work.
pub fn record_customer_outcome(outcome: &str) {
    CUSTOMERS_SYNCED.with_label_values(&[outcome]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
