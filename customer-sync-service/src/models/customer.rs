//! Customer model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Free-form provider metadata. Stored as serialized JSON text.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Mutable attribute set mirrored from the provider. Updates replace all of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerData {
    pub stripe_customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub address: Option<Address>,
    pub metadata: Metadata,
    pub currency: Option<String>,
    pub deleted: bool,
    pub delinquent: bool,
    /// Minor currency units.
    pub balance: i64,
    pub provider_created_at: Option<DateTime<Utc>>,
}

impl CustomerData {
    pub fn metadata_json(&self) -> Result<String, AppError> {
        Ok(serde_json::to_string(&self.metadata)?)
    }

    pub fn address_json(&self) -> Result<Option<String>, AppError> {
        self.address
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(AppError::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customer {
    pub customer_id: Uuid,
    #[serde(flatten)]
    pub data: CustomerData,
    pub last_sync_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Raw `customers` row; JSON columns are still text.
#[derive(Debug, Clone, FromRow)]
pub struct CustomerRow {
    pub customer_id: Uuid,
    pub stripe_customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub metadata: String,
    pub currency: Option<String>,
    pub deleted: bool,
    pub delinquent: bool,
    pub balance: i64,
    pub provider_created_at: Option<DateTime<Utc>>,
    pub last_sync_at: DateTime<Utc>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl TryFrom<CustomerRow> for Customer {
    type Error = AppError;

    fn try_from(row: CustomerRow) -> Result<Self, Self::Error> {
        let metadata = parse_metadata(&row.metadata)?;
        let address = row
            .address
            .as_deref()
            .map(serde_json::from_str::<Address>)
            .transpose()
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Corrupt address for customer {}: {}",
                    row.stripe_customer_id,
                    e
                ))
            })?;

        Ok(Self {
            customer_id: row.customer_id,
            data: CustomerData {
                stripe_customer_id: row.stripe_customer_id,
                email: row.email,
                name: row.name,
                description: row.description,
                phone: row.phone,
                address,
                metadata,
                currency: row.currency,
                deleted: row.deleted,
                delinquent: row.delinquent,
                balance: row.balance,
                provider_created_at: row.provider_created_at,
            },
            last_sync_at: row.last_sync_at,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

/// Parse a metadata text column. Empty text is treated as an empty map.
pub fn parse_metadata(raw: &str) -> Result<Metadata, AppError> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Corrupt metadata column: {}", e)))
}
