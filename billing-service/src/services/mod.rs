//! Services module for billing-service.

pub mod access;
pub mod analytics;
pub mod billing;
pub mod database;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod retry_policy;
pub mod scheduler;
pub mod store;
pub mod webhooks;

pub use access::{AccessDecision, AccessService};
pub use analytics::AnalyticsService;
pub use billing::{BillResult, BillingEngine};
pub use database::PgStore;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use retry_policy::RetryPolicy;
pub use scheduler::BillingScheduler;
pub use store::{BillingStore, RunTotals, WebhookApplication};
pub use webhooks::WebhookProcessor;
