//! Provider customer model.

use super::Provider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A customer record at a payment provider. Either a registered user or a guest.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProviderCustomer {
    pub customer_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
    pub display_name: Option<String>,
    pub provider: String,
    pub provider_customer_ref: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ProviderCustomer {
    pub fn is_guest(&self) -> bool {
        self.user_id.is_none()
    }
}

/// Input for creating a provider customer.
#[derive(Debug, Clone)]
pub struct CreateCustomer {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub guest_email: Option<String>,
    pub display_name: Option<String>,
    pub provider: Provider,
    pub provider_customer_ref: String,
}
