//! Billing provider abstraction.
//!
//! The provider is the system of record for customers and subscriptions. All
//! calls are read-only list/get calls that paginate with a `starting_after`
//! cursor and a `has_more` flag.

pub mod mock;
pub mod retrying;
pub mod stripe;

use crate::models::{Address, BillingInterval, CustomerData, Metadata, SubscriptionData, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::Retryable;
use std::time::Duration;
use thiserror::Error;

pub use mock::MockBillingProvider;
pub use retrying::RetryingProvider;
pub use stripe::StripeProvider;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::RateLimited { .. } => true,
            ProviderError::Api { status, .. } => *status >= 500,
            ProviderError::NotFound(_)
            | ProviderError::Authentication(_)
            | ProviderError::InvalidResponse(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ProviderError::RateLimited {
                message,
                retry_after,
            } => AppError::TooManyRequests(message, retry_after.map(|d| d.as_secs())),
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

// ============================================================================
// Pagination
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    pub limit: u32,
    pub starting_after: Option<String>,
}

impl PageParams {
    pub fn first(limit: u32) -> Self {
        Self {
            limit: limit.clamp(1, 100),
            starting_after: None,
        }
    }

    pub fn after(&self, cursor: String) -> Self {
        Self {
            limit: self.limit,
            starting_after: Some(cursor),
        }
    }
}

/// One page of provider records plus the cursor for the next page, if any.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub next_cursor: Option<String>,
}

// ============================================================================
// Provider records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub delinquent: bool,
    #[serde(default)]
    pub balance: i64,
    /// Unix seconds.
    #[serde(default)]
    pub created: Option<i64>,
}

impl From<&ProviderCustomer> for CustomerData {
    fn from(c: &ProviderCustomer) -> Self {
        Self {
            stripe_customer_id: c.id.clone(),
            email: c.email.clone(),
            name: c.name.clone(),
            description: c.description.clone(),
            phone: c.phone.clone(),
            address: c.address.clone(),
            metadata: c.metadata.clone(),
            currency: c.currency.clone(),
            deleted: c.deleted,
            delinquent: c.delinquent,
            balance: c.balance,
            provider_created_at: c.created.and_then(from_unix),
        }
    }
}

/// A product reference is an id unless the caller asked for expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductRef {
    Id(String),
    Object { id: String },
}

impl ProductRef {
    pub fn id(&self) -> &str {
        match self {
            ProductRef::Id(id) => id,
            ProductRef::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecurring {
    pub interval: String,
    #[serde(default = "default_interval_count")]
    pub interval_count: i32,
}

fn default_interval_count() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    pub product: Option<ProductRef>,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<ProviderRecurring>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSubscriptionItem {
    #[serde(default)]
    pub id: Option<String>,
    pub price: Option<ProviderPrice>,
    #[serde(default)]
    pub quantity: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderItemList {
    #[serde(default)]
    pub data: Vec<ProviderSubscriptionItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub customer: String,
    /// Raw provider status; unknown values are rejected per subscription.
    pub status: String,
    #[serde(default)]
    pub items: ProviderItemList,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TryFrom<&ProviderSubscription> for SubscriptionData {
    type Error = ProviderError;

    /// The first subscription item carries the price/product linkage; a
    /// subscription without one cannot be stored.
    fn try_from(s: &ProviderSubscription) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::from_string(&s.status).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "subscription {} has unknown status '{}'",
                s.id, s.status
            ))
        })?;
        let item = s.items.data.first().ok_or_else(|| {
            ProviderError::InvalidResponse(format!("subscription {} has no items", s.id))
        })?;
        let price = item.price.as_ref().ok_or_else(|| {
            ProviderError::InvalidResponse(format!("subscription {} item has no price", s.id))
        })?;
        if price.id.is_empty() {
            return Err(ProviderError::InvalidResponse(format!(
                "subscription {} price has an empty id",
                s.id
            )));
        }
        let product_id = price
            .product
            .as_ref()
            .map(|p| p.id().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!(
                    "price {} on subscription {} has no product",
                    price.id, s.id
                ))
            })?;

        Ok(Self {
            stripe_subscription_id: s.id.clone(),
            stripe_customer_id: s.customer.clone(),
            stripe_price_id: price.id.clone(),
            stripe_product_id: product_id,
            status,
            unit_amount: price.unit_amount.unwrap_or(0),
            quantity: item.quantity.unwrap_or(1),
            currency: price.currency.clone(),
            interval: price
                .recurring
                .as_ref()
                .and_then(|r| BillingInterval::from_string(&r.interval)),
            interval_count: price.recurring.as_ref().map_or(1, |r| r.interval_count),
            current_period_start: s.current_period_start.and_then(from_unix),
            current_period_end: s.current_period_end.and_then(from_unix),
            cancel_at_period_end: s.cancel_at_period_end,
            canceled_at: s.canceled_at.and_then(from_unix),
            ended_at: s.ended_at.and_then(from_unix),
            trial_start: s.trial_start.and_then(from_unix),
            trial_end: s.trial_end.and_then(from_unix),
            provider_created_at: s.created.and_then(from_unix),
            metadata: s.metadata.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub card: Option<CardDetails>,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceStatusTransitions {
    #[serde(default)]
    pub paid_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub status_transitions: InvoiceStatusTransitions,
}

impl Invoice {
    /// Payment date for paid invoices, falling back to creation time.
    pub fn paid_on(&self) -> Option<NaiveDate> {
        if self.status.as_deref() != Some("paid") {
            return None;
        }
        self.status_transitions
            .paid_at
            .or(self.created)
            .and_then(from_unix)
            .map(|dt| dt.date_naive())
    }
}

/// Most recent payment date across a set of invoices.
pub fn last_payment_date(invoices: &[Invoice]) -> Option<NaiveDate> {
    invoices.iter().filter_map(Invoice::paid_on).max()
}

/// Provider object ids are opaque `[A-Za-z0-9_]` tokens such as `cus_123`.
pub fn is_valid_object_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 255
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

// ============================================================================
// Client contract
// ============================================================================

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn list_customers(&self, params: &PageParams)
        -> Result<Page<ProviderCustomer>, ProviderError>;

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer, ProviderError>;

    /// Every subscription of the customer, in any status.
    async fn list_subscriptions(
        &self,
        customer_id: &str,
    ) -> Result<Vec<ProviderSubscription>, ProviderError>;

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> Result<Vec<PaymentMethod>, ProviderError>;

    async fn list_invoices(
        &self,
        customer_id: &str,
        params: &PageParams,
    ) -> Result<Page<Invoice>, ProviderError>;

    /// Walk every customer page, pausing `page_delay` between pages.
    ///
    /// The first error ends the walk and is returned; nothing is retried here.
    async fn get_all_customers(
        &self,
        page_size: u32,
        page_delay: Duration,
    ) -> Result<Vec<ProviderCustomer>, ProviderError> {
        let mut customers = Vec::new();
        let mut params = PageParams::first(page_size);
        let mut pages = 0u32;

        loop {
            let page = self.list_customers(&params).await?;
            pages += 1;
            customers.extend(page.data);

            match page.next_cursor {
                Some(cursor) => {
                    params = params.after(cursor);
                    if !page_delay.is_zero() {
                        tokio::time::sleep(page_delay).await;
                    }
                }
                None => break,
            }
        }

        tracing::info!(
            pages = pages,
            customers = customers.len(),
            "Fetched all customers from provider"
        );
        Ok(customers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription_json() -> serde_json::Value {
        json!({
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_123",
            "status": "active",
            "cancel_at_period_end": false,
            "current_period_start": 1_717_200_000,
            "current_period_end": 1_719_792_000,
            "created": 1_717_200_000,
            "metadata": {"plan": "clinic"},
            "items": {"object": "list", "data": [{
                "id": "si_1",
                "quantity": 1,
                "price": {
                    "id": "price_456",
                    "product": "prod_9",
                    "unit_amount": 10000,
                    "currency": "usd",
                    "recurring": {"interval": "month", "interval_count": 1}
                }
            }]}
        })
    }

    #[test]
    fn test_subscription_payload_converts() {
        let sub: ProviderSubscription = serde_json::from_value(subscription_json()).unwrap();
        let data = SubscriptionData::try_from(&sub).unwrap();

        assert_eq!(data.stripe_customer_id, "cus_123");
        assert_eq!(data.stripe_price_id, "price_456");
        assert_eq!(data.stripe_product_id, "prod_9");
        assert_eq!(data.status, SubscriptionStatus::Active);
        assert_eq!(data.interval, Some(BillingInterval::Month));
        assert_eq!(data.unit_amount, 10_000);
        assert!(data.current_period_start.is_some());
    }

    #[test]
    fn test_expanded_product_is_accepted() {
        let mut value = subscription_json();
        value["items"]["data"][0]["price"]["product"] = json!({"id": "prod_9", "name": "Clinic"});
        let sub: ProviderSubscription = serde_json::from_value(value).unwrap();
        assert_eq!(SubscriptionData::try_from(&sub).unwrap().stripe_product_id, "prod_9");
    }

    #[test]
    fn test_subscription_without_product_is_rejected() {
        let mut value = subscription_json();
        value["items"]["data"][0]["price"]["product"] = serde_json::Value::Null;
        let sub: ProviderSubscription = serde_json::from_value(value).unwrap();
        assert!(matches!(
            SubscriptionData::try_from(&sub),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_unknown_status_is_rejected_per_subscription() {
        let mut value = subscription_json();
        value["status"] = json!("some_new_status");
        let sub: ProviderSubscription = serde_json::from_value(value).unwrap();

        match SubscriptionData::try_from(&sub) {
            Err(ProviderError::InvalidResponse(msg)) => assert!(msg.contains("some_new_status")),
            other => panic!("expected InvalidResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_object_id_charset() {
        assert!(is_valid_object_id("cus_123"));
        assert!(is_valid_object_id("cus_NffrFeUfNV2Hib"));
        assert!(!is_valid_object_id(""));
        assert!(!is_valid_object_id("../charges/ch_1"));
        assert!(!is_valid_object_id("cus_1?expand=x"));
        assert!(!is_valid_object_id(&"a".repeat(256)));
    }

    #[test]
    fn test_subscription_without_items_is_rejected() {
        let mut value = subscription_json();
        value["items"] = json!({"data": []});
        let sub: ProviderSubscription = serde_json::from_value(value).unwrap();
        assert!(SubscriptionData::try_from(&sub).is_err());
    }

    #[test]
    fn test_deleted_customer_payload() {
        let customer: ProviderCustomer =
            serde_json::from_value(json!({"id": "cus_gone", "object": "customer", "deleted": true}))
                .unwrap();
        let data = CustomerData::from(&customer);
        assert!(data.deleted);
        assert!(data.metadata.is_empty());
    }

    #[test]
    fn test_retry_classification() {
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::Api { status: 503, message: "x".into() }.is_retryable());
        assert!(!ProviderError::Api { status: 400, message: "x".into() }.is_retryable());
        assert!(!ProviderError::NotFound("cus_1".into()).is_retryable());
        let limited = ProviderError::RateLimited {
            message: "slow".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_last_payment_date_ignores_unpaid() {
        let invoices = vec![
            Invoice {
                id: "in_1".into(),
                status: Some("paid".into()),
                amount_due: 100,
                amount_paid: 100,
                currency: None,
                created: Some(1_704_067_200),
                status_transitions: InvoiceStatusTransitions {
                    paid_at: Some(1_704_153_600),
                },
            },
            Invoice {
                id: "in_2".into(),
                status: Some("open".into()),
                amount_due: 100,
                amount_paid: 0,
                currency: None,
                created: Some(1_706_745_600),
                status_transitions: InvoiceStatusTransitions::default(),
            },
        ];
        assert_eq!(
            last_payment_date(&invoices),
            NaiveDate::from_ymd_opt(2024, 1, 2)
        );
    }

    #[test]
    fn test_provider_error_maps_to_app_error() {
        assert!(matches!(
            AppError::from(ProviderError::NotFound("cus_1".into())),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            AppError::from(ProviderError::Network("down".into())),
            AppError::BadGateway(_)
        ));
    }
}
