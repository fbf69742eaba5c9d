//! Subscription model and dunning state.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use sqlx::FromRow;
use uuid::Uuid;

use super::BillingInterval;

/// Billing status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingStatus {
    Active,
    PastDue,
    Suspended,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Active => "active",
            BillingStatus::PastDue => "past_due",
            BillingStatus::Suspended => "suspended",
            BillingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BillingStatus::Active),
            "past_due" => Some(BillingStatus::PastDue),
            "suspended" => Some(BillingStatus::Suspended),
            "cancelled" => Some(BillingStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether the scheduler should pick up subscriptions in this status.
    pub fn is_billable(&self) -> bool {
        matches!(self, BillingStatus::Active | BillingStatus::PastDue)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BillingStatus::Suspended | BillingStatus::Cancelled)
    }
}

/// Subscription.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub billing_status: String,
    pub amount: Decimal,
    pub currency: String,
    pub billing_interval: String,
    pub interval_count: i32,
    pub start_date: NaiveDate,
    pub trial_end_date: Option<NaiveDate>,
    pub current_period_start: NaiveDate,
    /// Paid-through date. The next billed period starts here.
    pub current_period_end: NaiveDate,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub billing_retry_count: i32,
    pub max_retry_attempts: i32,
    pub last_billing_attempt: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_utc: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub lease_owner: Option<String>,
    #[serde(skip_serializing)]
    pub lease_expires_utc: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn try_status(&self) -> Result<BillingStatus, AppError> {
        BillingStatus::parse(&self.billing_status).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Subscription {} has unknown billing status '{}'",
                self.subscription_id,
                self.billing_status
            ))
        })
    }

    pub fn try_interval(&self) -> Result<BillingInterval, AppError> {
        BillingInterval::parse(&self.billing_interval).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!(
                "Subscription {} has unknown billing interval '{}'",
                self.subscription_id,
                self.billing_interval
            ))
        })
    }

    /// Status for read-only decisions. An unknown status is logged and read
    /// as suspended so it is never billed.
    pub fn status(&self) -> BillingStatus {
        self.try_status().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Corrupt subscription row");
            BillingStatus::Suspended
        })
    }

    /// Interval for scheduling. Callers that charge must check
    /// [`Subscription::try_interval`] first.
    pub fn interval(&self) -> BillingInterval {
        self.try_interval().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Corrupt subscription row");
            BillingInterval::Monthly
        })
    }

    /// Date of the first charge. Month-based periods stay on its day of month.
    pub fn billing_anchor(&self) -> NaiveDate {
        self.trial_end_date
            .filter(|d| *d > self.start_date)
            .unwrap_or(self.start_date)
    }

    /// The period the next charge pays for.
    pub fn next_period(&self) -> (NaiveDate, NaiveDate) {
        let start = self.current_period_end;
        let end = self
            .interval()
            .period_end(self.billing_anchor(), start, self.interval_count);
        (start, end)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status().is_billable() && self.next_billing_date.is_some_and(|d| d <= now)
    }

    pub fn lease_is_free(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_none() || self.lease_expires_utc.map_or(true, |e| e <= now)
    }
}

/// Input for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscription {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub interval_count: i32,
    pub start_date: NaiveDate,
    pub trial_end_date: Option<NaiveDate>,
    pub max_retry_attempts: i32,
    pub metadata: Option<serde_json::Value>,
}

/// Filter parameters for listing subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ListSubscriptionsFilter {
    pub customer_id: Option<Uuid>,
    pub status: Option<BillingStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

/// New dunning state for a subscription after a billing attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionTransition {
    pub status: BillingStatus,
    pub billing_retry_count: i32,
    pub current_period_start: NaiveDate,
    pub current_period_end: NaiveDate,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub last_billing_attempt: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_utc: Option<DateTime<Utc>>,
}
