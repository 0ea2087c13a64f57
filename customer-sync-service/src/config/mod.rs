//! Configuration module for customer-sync-service.

use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CustomerSyncConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Billing provider (Stripe) connection settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_base: String,
    pub page_size: u32,
    pub page_delay: Duration,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl ProviderConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Customers processed concurrently per batch.
    pub batch_size: usize,
    /// Pause between batches so the pool and the provider can breathe.
    pub batch_delay: Duration,
    /// Window used by the status endpoint to count "recently synced" customers.
    pub recent_window: chrono::Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay: Duration::from_millis(50),
            recent_window: chrono::Duration::hours(24),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Like `env_or`, but a value that is set and does not parse is an error.
fn env_strict<T: FromStr>(key: &str, default: T) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    parse_setting(key, env::var(key).ok(), default)
}

fn parse_setting<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, value, e))
        }),
    }
}

impl CustomerSyncConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "customer-sync-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_strict("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_strict("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            provider: ProviderConfig {
                api_key: env::var("STRIPE_SECRET_KEY").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("STRIPE_SECRET_KEY is required"))
                })?,
                api_base: env::var("STRIPE_API_BASE")
                    .unwrap_or_else(|_| "https://api.stripe.com/v1".to_string()),
                page_size: env_or::<u32>("PROVIDER_PAGE_SIZE", 100).clamp(1, 100),
                page_delay: Duration::from_millis(env_or("PROVIDER_PAGE_DELAY_MS", 100)),
                timeout: Duration::from_secs(env_or("PROVIDER_TIMEOUT_SECS", 30)),
                max_retries: env_or("PROVIDER_MAX_RETRIES", 3),
                initial_backoff: Duration::from_millis(env_or("PROVIDER_INITIAL_BACKOFF_MS", 200)),
            },
            sync: SyncConfig {
                batch_size: env_strict("SYNC_BATCH_SIZE", 5)?,
                batch_delay: Duration::from_millis(env_or("SYNC_BATCH_DELAY_MS", 50)),
                recent_window: chrono::Duration::hours(env_or("SYNC_RECENT_WINDOW_HOURS", 24)),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the sync pipeline cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sync.batch_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SYNC_BATCH_SIZE must be at least 1"
            )));
        }
        if self.sync.batch_size as u32 >= self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SYNC_BATCH_SIZE ({}) must be smaller than DATABASE_MAX_CONNECTIONS ({})",
                self.sync.batch_size,
                self.database.max_connections
            )));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS cannot exceed DATABASE_MAX_CONNECTIONS"
            )));
        }
        Ok(())
    }
}
