//! Payment provider adapters.
//!
//! Each adapter charges a stored payment method and verifies/parses the
//! provider's webhooks behind the [`PaymentProvider`] trait. The billing
//! engine only ever talks to a [`ProviderRegistry`].

pub mod authorize_net;
pub mod mock;
pub mod paypal;
pub mod stripe;

pub use authorize_net::AuthorizeNetProvider;
pub use mock::{MockProvider, MockResponse};
pub use paypal::PaypalProvider;
pub use stripe::StripeProvider;

use crate::config::BillingConfig;
pub use crate::models::Provider;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::retry::Retryable;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// A charge against a stored payment method.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    /// Stable per attempt; forwarded so a resend can never double charge.
    pub idempotency_key: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_ref: String,
    pub payment_method_ref: String,
    pub description: String,
    pub invoice_id: Uuid,
}

/// Definite result of a charge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved {
        provider_payment_ref: String,
    },
    Declined {
        code: String,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network failure, 5xx or 429. The charge outcome is unknown.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider refused the request itself (4xx, bad credentials).
    #[error("Provider rejected request: {0}")]
    Rejected(String),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidSignature(msg) => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid webhook signature: {}", msg))
            }
            ProviderError::InvalidPayload(msg) => {
                AppError::BadRequest(anyhow::anyhow!("Invalid webhook payload: {}", msg))
            }
            ProviderError::NotConfigured(_) => AppError::ServiceUnavailable,
            other => AppError::BadGateway(other.to_string()),
        }
    }
}

/// Normalised webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEvent {
    pub event_id: String,
    pub event_type: String,
    pub kind: ProviderEventKind,
}

/// Effect of a webhook event, keyed by provider payment reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEventKind {
    PaymentSucceeded(String),
    PaymentFailed(String),
    PaymentRefunded(String),
    Ignored,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Charge a stored payment method.
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError>;

    /// Verify authenticity and parse a webhook delivery.
    async fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProviderEvent, ProviderError>;
}

/// Configured providers, keyed by identity.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Provider, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every provider with credentials in the config.
    pub fn from_config(config: &BillingConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        let mut registry = Self::new();

        if config.mock_providers {
            for provider in Provider::ALL {
                registry.register(Arc::new(MockProvider::for_provider(provider)));
            }
        }
        if let Some(stripe) = &config.stripe {
            registry.register(Arc::new(StripeProvider::new(stripe.clone(), http.clone())));
        }
        if let Some(paypal) = &config.paypal {
            registry.register(Arc::new(PaypalProvider::new(paypal.clone(), http.clone())));
        }
        if let Some(anet) = &config.authorize_net {
            registry.register(Arc::new(AuthorizeNetProvider::new(anet.clone(), http)));
        }

        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for the same provider.
    pub fn register(&mut self, adapter: Arc<dyn PaymentProvider>) -> &mut Self {
        self.providers.insert(adapter.provider(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn PaymentProvider>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn PaymentProvider>, ProviderError> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(provider.to_string()))
    }

    pub fn registered(&self) -> Vec<Provider> {
        let mut list: Vec<Provider> = self.providers.keys().copied().collect();
        list.sort_by_key(|p| p.as_str());
        list
    }
}

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "ISK", "JPY", "KMF", "KRW", "MGA", "PYG", "RWF", "UGX", "VND",
    "VUV", "XAF", "XOF", "XPF",
];

pub fn is_zero_decimal(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
}

/// Integer minor units (cents) for a major-unit amount.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ProviderError> {
    let scaled = if is_zero_decimal(currency) {
        amount
    } else {
        amount * Decimal::from(100)
    };
    scaled
        .round()
        .to_i64()
        .ok_or_else(|| ProviderError::Rejected(format!("Amount out of range: {}", amount)))
}

/// Two-decimal string amount, e.g. `"10.50"`.
pub fn format_major_units(amount: Decimal) -> String {
    format!("{:.2}", amount.round_dp(2))
}

/// Map a transport failure. Every reqwest error leaves the outcome unknown.
pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> ProviderError {
    ProviderError::Transient(format!("{} request failed: {}", provider, err))
}

/// Classify a non-success HTTP status that carries no decline.
pub(crate) fn status_error(provider: Provider, status: StatusCode, body: &str) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::CONFLICT
        || status.is_server_error()
    {
        ProviderError::Transient(format!("{} returned {}", provider, status))
    } else {
        let snippet: String = body.chars().take(200).collect();
        ProviderError::Rejected(format!("{} returned {}: {}", provider, status, snippet))
    }
}

/// Header value as a string, if present and valid.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_minor_units() {
        let amount = Decimal::from_str("19.99").unwrap();
        assert_eq!(to_minor_units(amount, "USD").unwrap(), 1999);
        assert_eq!(to_minor_units(amount, "usd").unwrap(), 1999);
        assert_eq!(to_minor_units(Decimal::from(500), "JPY").unwrap(), 500);
    }

    #[test]
    fn test_format_major_units() {
        assert_eq!(format_major_units(Decimal::from(10)), "10.00");
        assert_eq!(format_major_units(Decimal::from_str("10.5").unwrap()), "10.50");
        assert_eq!(format_major_units(Decimal::from_str("9.999").unwrap()), "10.00");
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(!ProviderError::Rejected("x".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("x".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_status_mapping() {
        use axum::http::StatusCode;
        let err: AppError = ProviderError::InvalidSignature("bad".into()).into();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        let err: AppError = ProviderError::NotConfigured("paypal".into()).into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        let err: AppError = ProviderError::Transient("timeout".into()).into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::for_provider(Provider::Paypal)));
        assert!(registry.get(Provider::Paypal).is_ok());
        assert!(matches!(
            registry.get(Provider::Stripe),
            Err(ProviderError::NotConfigured(_))
        ));
        assert_eq!(registry.registered(), vec![Provider::Paypal]);
    }
}
