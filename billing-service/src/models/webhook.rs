//! Webhook event log model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A provider event that has been processed. `(provider, event_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEventRecord {
    pub provider: String,
    pub event_id: String,
    pub event_type: String,
    pub received_utc: DateTime<Utc>,
}
