//! PayPal adapter.
//!
//! Uses the Orders v2 API with a vaulted payment source and the
//! verify-webhook-signature API. Requests are authenticated with an OAuth2
//! client-credentials token that is cached until shortly before expiry.

use super::{
    format_major_units, header_str, status_error, transport_error, ChargeOutcome, ChargeRequest,
    PaymentProvider, Provider, ProviderError, ProviderEvent, ProviderEventKind,
};
use crate::config::PaypalConfig;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Refresh the token this long before PayPal says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const HARD_DECLINES: &[&str] = &[
    "CARD_CLOSED",
    "CARD_EXPIRED",
    "INVALID_RESOURCE_ID",
    "PAYER_ACCOUNT_LOCKED_OR_CLOSED",
    "PAYER_ACCOUNT_RESTRICTED",
    "PAYER_CANNOT_PAY",
];

const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-auth-algo",
    "paypal-cert-url",
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
];

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct PaypalProvider {
    http: Client,
    config: PaypalConfig,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
struct CreateOrder<'a> {
    intent: &'static str,
    purchase_units: Vec<PurchaseUnit<'a>>,
    payment_source: PaymentSource<'a>,
}

#[derive(Debug, Serialize)]
struct PurchaseUnit<'a> {
    reference_id: String,
    invoice_id: String,
    custom_id: &'a str,
    description: &'a str,
    amount: Amount,
}

#[derive(Debug, Serialize)]
struct Amount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct PaymentSource<'a> {
    paypal: VaultedSource<'a>,
}

#[derive(Debug, Serialize)]
struct VaultedSource<'a> {
    vault_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    status: String,
    #[serde(default)]
    purchase_units: Vec<OrderPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct OrderPurchaseUnit {
    payments: Option<OrderPayments>,
}

#[derive(Debug, Deserialize)]
struct OrderPayments {
    #[serde(default)]
    captures: Vec<Capture>,
}

#[derive(Debug, Deserialize)]
struct Capture {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PaypalErrorBody {
    name: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<PaypalErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PaypalErrorDetail {
    issue: String,
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct VerifySignatureRequest<'a> {
    auth_algo: &'a str,
    cert_url: &'a str,
    transmission_id: &'a str,
    transmission_sig: &'a str,
    transmission_time: &'a str,
    webhook_id: &'a str,
    webhook_event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VerifySignatureResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct PaypalEvent {
    id: String,
    event_type: String,
    resource: PaypalResource,
}

#[derive(Debug, Deserialize)]
struct PaypalResource {
    id: String,
    #[serde(default)]
    links: Vec<PaypalLink>,
}

#[derive(Debug, Deserialize)]
struct PaypalLink {
    href: String,
    rel: String,
}

impl PaypalProvider {
    pub fn new(config: PaypalConfig, http: Client) -> Self {
        Self {
            http,
            config,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/v1/oauth2/token", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .basic_auth(
                &self.config.client_id,
                Some(self.config.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        if !status.is_success() {
            tracing::warn!(status = %status, "PayPal token request failed");
            return Err(status_error(Provider::Paypal, status, &body));
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("token: {}", e)))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        tracing::debug!(expires_in = token.expires_in, "PayPal access token refreshed");
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    fn decline(error: &PaypalErrorBody) -> ChargeOutcome {
        let detail = error.details.first();
        let code = detail
            .map(|d| d.issue.clone())
            .or_else(|| error.name.clone())
            .unwrap_or_else(|| "UNPROCESSABLE_ENTITY".to_string());
        let message = detail
            .and_then(|d| d.description.clone())
            .or_else(|| error.message.clone())
            .unwrap_or_else(|| "Payment declined".to_string());
        let retryable = !HARD_DECLINES.contains(&code.as_str());
        ChargeOutcome::Declined {
            code,
            message,
            retryable,
        }
    }
}

#[async_trait]
impl PaymentProvider for PaypalProvider {
    fn provider(&self) -> Provider {
        Provider::Paypal
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let token = self.access_token().await?;

        let order = CreateOrder {
            intent: "CAPTURE",
            purchase_units: vec![PurchaseUnit {
                reference_id: request.invoice_id.to_string(),
                invoice_id: request.invoice_id.to_string(),
                custom_id: &request.idempotency_key,
                description: &request.description,
                amount: Amount {
                    currency_code: request.currency.to_uppercase(),
                    value: format_major_units(request.amount),
                },
            }],
            payment_source: PaymentSource {
                paypal: VaultedSource {
                    vault_id: &request.payment_method_ref,
                },
            },
        };

        let url = format!("{}/v2/checkout/orders", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header("PayPal-Request-Id", &request.idempotency_key)
            .header("Prefer", "return=representation")
            .json(&order)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        tracing::debug!(status = %status, "PayPal create order response");

        if status.is_success() {
            let order: OrderResponse = serde_json::from_str(&body)
                .map_err(|e| ProviderError::InvalidResponse(format!("order: {}", e)))?;
            let capture = order
                .purchase_units
                .iter()
                .filter_map(|u| u.payments.as_ref())
                .flat_map(|p| p.captures.iter())
                .next();

            return match capture {
                Some(c) if c.status == "COMPLETED" || c.status == "PENDING" => {
                    Ok(ChargeOutcome::Approved {
                        provider_payment_ref: c.id.clone(),
                    })
                }
                Some(c) if c.status == "DECLINED" || c.status == "FAILED" => {
                    Ok(ChargeOutcome::Declined {
                        code: format!("CAPTURE_{}", c.status),
                        message: format!("PayPal capture {} for order {}", c.status, order.id),
                        retryable: true,
                    })
                }
                _ => Err(ProviderError::InvalidResponse(format!(
                    "Order {} has status {} without a usable capture",
                    order.id, order.status
                ))),
            };
        }

        match status {
            StatusCode::UNPROCESSABLE_ENTITY => {
                let error: PaypalErrorBody = serde_json::from_str(&body)
                    .map_err(|e| ProviderError::InvalidResponse(format!("error body: {}", e)))?;
                Ok(Self::decline(&error))
            }
            StatusCode::UNAUTHORIZED => {
                self.invalidate_token().await;
                Err(ProviderError::Transient(
                    "PayPal access token rejected".to_string(),
                ))
            }
            _ => Err(status_error(Provider::Paypal, status, &body)),
        }
    }

    async fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let mut values = Vec::with_capacity(TRANSMISSION_HEADERS.len());
        for name in TRANSMISSION_HEADERS {
            let value = header_str(headers, name).ok_or_else(|| {
                ProviderError::InvalidSignature(format!("Missing {} header", name))
            })?;
            values.push(value);
        }

        let webhook_event: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;

        let verify = VerifySignatureRequest {
            auth_algo: values[0],
            cert_url: values[1],
            transmission_id: values[2],
            transmission_sig: values[3],
            transmission_time: values[4],
            webhook_id: &self.config.webhook_id,
            webhook_event: webhook_event.clone(),
        };

        let token = self.access_token().await?;
        let url = format!(
            "{}/v1/notifications/verify-webhook-signature",
            self.config.api_base
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&verify)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Paypal, e))?;

        if !status.is_success() {
            return Err(status_error(Provider::Paypal, status, &text));
        }

        let verdict: VerifySignatureResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("verification: {}", e)))?;
        if verdict.verification_status != "SUCCESS" {
            return Err(ProviderError::InvalidSignature(format!(
                "verification_status {}",
                verdict.verification_status
            )));
        }

        let event: PaypalEvent = serde_json::from_value(webhook_event)
            .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        Ok(to_provider_event(event))
    }
}

fn to_provider_event(event: PaypalEvent) -> ProviderEvent {
    let kind = match event.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" => ProviderEventKind::PaymentSucceeded(event.resource.id.clone()),
        "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
            ProviderEventKind::PaymentFailed(event.resource.id.clone())
        }
        "PAYMENT.CAPTURE.REFUNDED" | "PAYMENT.CAPTURE.REVERSED" => {
            // The resource is the refund; its "up" link points at the capture.
            let capture_id = event
                .resource
                .links
                .iter()
                .find(|l| l.rel == "up")
                .and_then(|l| l.href.rsplit('/').next())
                .map(|s| s.to_string())
                .unwrap_or_else(|| event.resource.id.clone());
            ProviderEventKind::PaymentRefunded(capture_id)
        }
        _ => ProviderEventKind::Ignored,
    };

    ProviderEvent {
        event_id: event.id,
        event_type: event.event_type,
        kind,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use secrecy::Secret;
    use std::str::FromStr;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base: &str) -> PaypalProvider {
        PaypalProvider::new(
            PaypalConfig {
                client_id: "client".to_string(),
                client_secret: Secret::new("secret".to_string()),
                webhook_id: "WH-1".to_string(),
                api_base: base.to_string(),
            },
            Client::new(),
        )
    }

    fn request() -> ChargeRequest {
        ChargeRequest {
            idempotency_key: "sub:20250101:2".to_string(),
            amount: Decimal::from_str("25").unwrap(),
            currency: "usd".to_string(),
            customer_ref: "payer_1".to_string(),
            payment_method_ref: "vault_1".to_string(),
            description: "Silver membership".to_string(),
            invoice_id: Uuid::new_v4(),
        }
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "A21AA",
                "expires_in": 32400
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_charge_completed_capture() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .and(header("PayPal-Request-Id", "sub:20250101:2"))
            .and(header("Authorization", "Bearer A21AA"))
            .and(body_partial_json(serde_json::json!({
                "purchase_units": [{"amount": {"currency_code": "USD", "value": "25.00"}}]
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "ORDER-1",
                "status": "COMPLETED",
                "purchase_units": [{"payments": {"captures": [{"id": "CAP-1", "status": "COMPLETED"}]}}]
            })))
            .mount(&server)
            .await;

        let provider = provider(&server.uri());
        let outcome = provider.charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Approved {
                provider_payment_ref: "CAP-1".to_string()
            }
        );
        // Second charge reuses the cached token
        provider.charge(&request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_charge_instrument_declined() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
                "name": "UNPROCESSABLE_ENTITY",
                "message": "The requested action could not be performed",
                "details": [{"issue": "INSTRUMENT_DECLINED", "description": "The instrument was declined"}]
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Declined {
                code: "INSTRUMENT_DECLINED".to_string(),
                message: "The instrument was declined".to_string(),
                retryable: true,
            }
        );
    }

    #[tokio::test]
    async fn test_charge_rate_limited_is_transient() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[tokio::test]
    async fn test_bad_credentials_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Rejected(_))));
    }

    fn webhook_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        for name in TRANSMISSION_HEADERS {
            headers.insert(name, "value".parse().unwrap());
        }
        headers
    }

    #[tokio::test]
    async fn test_webhook_verified_refund() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v1/notifications/verify-webhook-signature"))
            .and(body_partial_json(serde_json::json!({"webhook_id": "WH-1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"verification_status": "SUCCESS"})),
            )
            .mount(&server)
            .await;

        let body = serde_json::to_vec(&serde_json::json!({
            "id": "WH-EVT-1",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "REFUND-1",
                "links": [{"href": "https://api.paypal.com/v2/payments/captures/CAP-9", "rel": "up"}]
            }
        }))
        .unwrap();

        let event = provider(&server.uri())
            .parse_webhook(&webhook_headers(), &body)
            .await
            .unwrap();
        assert_eq!(event.event_id, "WH-EVT-1");
        assert_eq!(
            event.kind,
            ProviderEventKind::PaymentRefunded("CAP-9".to_string())
        );
    }

    #[tokio::test]
    async fn test_webhook_failed_verification() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/v1/notifications/verify-webhook-signature"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"verification_status": "FAILURE"})),
            )
            .mount(&server)
            .await;

        let body = br#"{"id":"WH-2","event_type":"PAYMENT.CAPTURE.COMPLETED","resource":{"id":"CAP-1"}}"#;
        let result = provider(&server.uri())
            .parse_webhook(&webhook_headers(), body)
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_webhook_missing_headers() {
        let result = provider("http://unused")
            .parse_webhook(&HeaderMap::new(), b"{}")
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }
}
