//! Stored payment method model.

use super::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A tokenised payment method held at the provider.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub payment_method_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub provider: String,
    pub provider_method_ref: String,
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub is_default: bool,
    pub created_utc: DateTime<Utc>,
}

/// Input for attaching a payment method to a customer.
#[derive(Debug, Clone)]
pub struct CreatePaymentMethod {
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub provider: Provider,
    pub provider_method_ref: String,
    pub kind: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<i32>,
    pub exp_year: Option<i32>,
    pub is_default: bool,
}
