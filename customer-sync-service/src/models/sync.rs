//! Statistics reported by a sync run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Whether a save inserted a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// A single item that failed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncItemError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub error: String,
}

impl SyncItemError {
    pub fn customer(customer_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            subscription_id: None,
            error: error.into(),
        }
    }

    pub fn subscription(
        customer_id: impl Into<String>,
        subscription_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            subscription_id: Some(subscription_id.into()),
            error: error.into(),
        }
    }
}

/// Counters for one entity kind.
///
/// `processed` counts items whose write committed; failed items appear only in
/// `errors`. Callers must inspect `errors` even when the run returned `Ok`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityStats {
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub errors: Vec<SyncItemError>,
}

impl EntityStats {
    pub fn record(&mut self, outcome: WriteOutcome) {
        self.processed += 1;
        match outcome {
            WriteOutcome::Created => self.created += 1,
            WriteOutcome::Updated => self.updated += 1,
        }
    }

    pub fn attempted(&self) -> u32 {
        self.processed + self.errors.len() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStats {
    pub customers: EntityStats,
    pub subscriptions: EntityStats,
    pub metrics_calculated: u32,
    /// Date whose daily aggregate was recomputed, full runs only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_date: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self {
            customers: EntityStats::default(),
            subscriptions: EntityStats::default(),
            metrics_calculated: 0,
            analytics_date: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.customers.errors.is_empty() || !self.subscriptions.errors.is_empty()
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new()
    }
}
