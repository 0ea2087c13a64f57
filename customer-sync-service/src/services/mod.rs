pub mod calculator;
pub mod customer_store;
pub mod database;
pub mod memory;
pub mod metrics;
pub mod metrics_store;
pub mod orchestrator;
pub mod repository;
pub mod subscription_store;

pub use customer_store::CustomerStore;
pub use database::Database;
pub use memory::MemoryRepository;
pub use metrics::{get_metrics, init_metrics};
pub use metrics_store::MetricsStore;
pub use orchestrator::{SyncOrchestrator, SyncPhase, SyncSettings};
pub use repository::{CustomerUnit, PgSyncRepository, SyncRepository, UnitOutcome};
pub use subscription_store::SubscriptionStore;
