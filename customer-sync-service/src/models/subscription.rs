//! Subscription model.

use super::customer::{parse_metadata, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Subscription status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionStatus::Active)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurring interval of the subscribed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "day" => Some(BillingInterval::Day),
            "week" => Some(BillingInterval::Week),
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// Mutable attribute set mirrored from the provider. Updates replace all of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: String,
    pub stripe_product_id: String,
    pub status: SubscriptionStatus,
    /// Price amount per unit, minor currency units.
    pub unit_amount: i64,
    pub quantity: i64,
    pub currency: Option<String>,
    /// `None` for one-off prices.
    pub interval: Option<BillingInterval>,
    pub interval_count: i32,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub provider_created_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

impl SubscriptionData {
    pub fn metadata_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&self.metadata)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    #[serde(flatten)]
    pub data: SubscriptionData,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Raw `customer_subscriptions` row.
#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub subscription_id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_price_id: String,
    pub stripe_product_id: String,
    pub status: String,
    pub unit_amount: i64,
    pub quantity: i64,
    pub currency: Option<String>,
    pub billing_interval: Option<String>,
    pub interval_count: i32,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub trial_start: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub provider_created_at: Option<DateTime<Utc>>,
    pub metadata: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = AppError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::from_string(&row.status).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Unknown status '{}' on subscription {}",
                row.status,
                row.stripe_subscription_id
            ))
        })?;

        Ok(Self {
            subscription_id: row.subscription_id,
            data: SubscriptionData {
                stripe_subscription_id: row.stripe_subscription_id,
                stripe_customer_id: row.stripe_customer_id,
                stripe_price_id: row.stripe_price_id,
                stripe_product_id: row.stripe_product_id,
                status,
                unit_amount: row.unit_amount,
                quantity: row.quantity,
                currency: row.currency,
                interval: row
                    .billing_interval
                    .as_deref()
                    .and_then(BillingInterval::from_string),
                interval_count: row.interval_count,
                current_period_start: row.current_period_start,
                current_period_end: row.current_period_end,
                cancel_at_period_end: row.cancel_at_period_end,
                canceled_at: row.canceled_at,
                ended_at: row.ended_at,
                trial_start: row.trial_start,
                trial_end: row.trial_end,
                provider_created_at: row.provider_created_at,
                metadata: parse_metadata(&row.metadata)?,
            },
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}
