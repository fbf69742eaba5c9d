//! Request and response bodies for the HTTP API.

use crate::models::{BillingRun, BillingRunResult, Invoice, Payment, Provider, Subscription};
use crate::services::BillResult;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_interval_count() -> i32 {
    1
}

fn non_negative(value: &Decimal) -> Result<(), ValidationError> {
    if value.is_sign_negative() {
        return Err(ValidationError::new("negative_amount"));
    }
    Ok(())
}

// Customers

#[derive(Debug, Deserialize, Validate)]
pub struct CreateCustomerRequest {
    pub user_id: Option<Uuid>,
    #[validate(email(message = "Invalid guest email address"))]
    pub guest_email: Option<String>,
    #[validate(length(max = 200))]
    pub display_name: Option<String>,
    pub provider: Provider,
    #[validate(length(min = 1, max = 255, message = "Provider customer reference is required"))]
    pub provider_customer_ref: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListQuery {
    #[validate(range(min = 1, max = 100))]
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

// Payment methods

#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentMethodRequest {
    pub provider: Provider,
    #[validate(length(min = 1, max = 255, message = "Provider method reference is required"))]
    pub provider_method_ref: String,
    #[validate(length(min = 1, max = 32))]
    pub kind: String,
    pub brand: Option<String>,
    #[validate(length(equal = 4, message = "last4 must be four digits"))]
    pub last4: Option<String>,
    #[validate(range(min = 1, max = 12))]
    pub exp_month: Option<i32>,
    #[validate(range(min = 2000, max = 2100))]
    pub exp_year: Option<i32>,
    #[serde(default)]
    pub is_default: bool,
}

// Membership types

#[derive(Debug, Deserialize, Validate)]
pub struct CreateMembershipTypeRequest {
    #[validate(length(min = 1, max = 100, message = "Name cannot be empty"))]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[validate(custom(function = "non_negative"))]
    pub price: Decimal,
    #[validate(length(equal = 3, message = "Currency must be an ISO 4217 code"))]
    #[serde(default = "default_currency")]
    pub currency: String,
    /// One of `daily`, `weekly`, `monthly`, `quarterly`, `annually`.
    pub billing_interval: String,
    #[validate(range(min = 1, max = 36))]
    #[serde(default = "default_interval_count")]
    pub interval_count: i32,
    #[serde(default = "default_true")]
    pub is_recurring: bool,
    #[validate(range(min = 1))]
    pub duration_days: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListMembershipTypesQuery {
    #[serde(default)]
    pub active_only: bool,
}

// Subscriptions

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubscriptionRequest {
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    /// Defaults to today.
    pub start_date: Option<NaiveDate>,
    #[validate(range(min = 0, max = 365))]
    pub trial_days: Option<i32>,
    #[validate(range(min = 1, max = 10))]
    pub max_retry_attempts: Option<i32>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListSubscriptionsQuery {
    pub customer_id: Option<Uuid>,
    pub status: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    #[serde(default = "default_true")]
    pub at_period_end: bool,
}

impl Default for CancelSubscriptionRequest {
    fn default() -> Self {
        Self {
            at_period_end: true,
        }
    }
}

// Orders

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub membership_type_id: Uuid,
    pub payment_method_id: Option<Uuid>,
}

// Billing runs

#[derive(Debug, Deserialize, Validate)]
pub struct ListBillingRunsQuery {
    pub status: Option<String>,
    pub run_type: Option<String>,
    #[validate(range(min = 1, max = 100))]
    pub page_size: Option<i32>,
    pub page_token: Option<Uuid>,
}

// Access and memberships

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyAccessRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, max = 100, message = "Feature cannot be empty"))]
    pub feature: String,
}

#[derive(Debug, Deserialize)]
pub struct MembershipsQuery {
    pub customer_id: Uuid,
}

// Analytics

#[derive(Debug, Deserialize, Validate)]
pub struct RevenueQuery {
    /// Defaults to today (UTC).
    pub date: Option<NaiveDate>,
    #[validate(length(equal = 3))]
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MrrQuery {
    #[validate(length(equal = 3))]
    #[serde(default = "default_currency")]
    pub currency: String,
}

// Responses

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<Uuid>,
}

impl<T> ListResponse<T> {
    /// A full page carries the last id as the token for the next one.
    pub fn page(items: Vec<T>, page_size: Option<i32>, id: impl Fn(&T) -> Uuid) -> Self {
        let full = page_size.unwrap_or(50).clamp(1, 100) as usize;
        let next_page_token = if items.len() >= full {
            items.last().map(id)
        } else {
            None
        };
        Self {
            items,
            next_page_token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InvoiceDetailResponse {
    #[serde(flatten)]
    pub invoice: Invoice,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Serialize)]
pub struct BillingRunDetailResponse {
    #[serde(flatten)]
    pub run: BillingRun,
    pub results: Vec<BillingRunResult>,
}

#[derive(Debug, Serialize)]
pub struct BillResultResponse {
    pub subscription_id: Uuid,
    pub status: &'static str,
    pub invoice_id: Option<Uuid>,
    pub message: Option<String>,
    pub subscription: Option<Subscription>,
}

impl From<BillResult> for BillResultResponse {
    fn from(result: BillResult) -> Self {
        Self {
            subscription_id: result.subscription_id,
            status: result.status.as_str(),
            invoice_id: result.invoice_id,
            message: result.message,
            subscription: result.subscription,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BillNowResponse {
    pub run: BillingRun,
    pub result: BillResultResponse,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_page_yields_token() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let page = ListResponse::page(ids.clone(), Some(3), |id| *id);
        assert_eq!(page.next_page_token, Some(ids[2]));

        let partial = ListResponse::page(ids, Some(10), |id| *id);
        assert!(partial.next_page_token.is_none());
    }

    #[test]
    fn test_negative_price_rejected() {
        let request: CreateMembershipTypeRequest = serde_json::from_value(serde_json::json!({
            "name": "Gold",
            "price": "-1.00",
            "billing_interval": "monthly"
        }))
        .unwrap();
        assert!(request.validate().is_err());
        assert_eq!(request.currency, "USD");
        assert!(request.is_recurring);
    }

    #[test]
    fn test_max_retry_attempts_must_be_positive() {
        let request = |attempts: i32| -> CreateSubscriptionRequest {
            serde_json::from_value(serde_json::json!({
                "customer_id": Uuid::new_v4(),
                "membership_type_id": Uuid::new_v4(),
                "max_retry_attempts": attempts
            }))
            .unwrap()
        };
        assert!(request(0).validate().is_err());
        assert!(request(-1).validate().is_err());
        assert!(request(1).validate().is_ok());
        assert!(request(10).validate().is_ok());
        assert!(request(11).validate().is_err());
    }

    #[test]
    fn test_cancel_defaults_to_period_end() {
        let request: CancelSubscriptionRequest = serde_json::from_str("{}").unwrap();
        assert!(request.at_period_end);
    }
}
