//! Analytics snapshot model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of precomputed metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    DailyRevenue,
    Mrr,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::DailyRevenue => "daily_revenue",
            MetricType::Mrr => "mrr",
        }
    }
}

/// A cached metric value for one tenant, date, metric and currency.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalyticsSnapshot {
    pub snapshot_id: Uuid,
    pub tenant_id: Uuid,
    pub snapshot_date: NaiveDate,
    pub metric_type: String,
    pub currency: String,
    pub value: Decimal,
    pub sample_count: i64,
    pub computed_utc: DateTime<Utc>,
}
