//! Domain models for customer-sync-service.

pub mod customer;
pub mod metrics;
pub mod subscription;
pub mod sync;

pub use customer::{Address, Customer, CustomerData, CustomerRow, Metadata};
pub use metrics::{CustomerMetrics, DailyAnalytics, SyncStatus};
pub use subscription::{
    BillingInterval, Subscription, SubscriptionData, SubscriptionRow, SubscriptionStatus,
};
pub use sync::{EntityStats, SyncItemError, SyncStats, WriteOutcome};
