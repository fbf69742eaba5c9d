//! Stripe adapter.
//!
//! Charges off-session through the PaymentIntents API and verifies
//! `Stripe-Signature` webhook headers.

use super::{
    header_str, status_error, to_minor_units, transport_error, ChargeOutcome, ChargeRequest,
    PaymentProvider, Provider, ProviderError, ProviderEvent, ProviderEventKind,
};
use crate::config::StripeConfig;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::utils::signature::{constant_time_eq, hmac_sha256_hex};

/// Maximum age of a signed webhook, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Declines that will not succeed on retry without customer action.
const HARD_DECLINES: &[&str] = &[
    "authentication_required",
    "card_not_supported",
    "currency_not_supported",
    "expired_card",
    "fraudulent",
    "incorrect_number",
    "invalid_account",
    "lost_card",
    "pickup_card",
    "restricted_card",
    "security_violation",
    "stolen_card",
];

#[derive(Clone)]
pub struct StripeProvider {
    http: Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    last_payment_error: Option<StripeErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
    decline_code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

impl StripeProvider {
    pub fn new(config: StripeConfig, http: Client) -> Self {
        Self { http, config }
    }

    fn decline(body: &StripeErrorBody) -> ChargeOutcome {
        let code = body
            .decline_code
            .clone()
            .or_else(|| body.code.clone())
            .unwrap_or_else(|| "card_declined".to_string());
        let retryable = !HARD_DECLINES.contains(&code.as_str());
        ChargeOutcome::Declined {
            message: body
                .message
                .clone()
                .unwrap_or_else(|| "Card declined".to_string()),
            code,
            retryable,
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let amount = to_minor_units(request.amount, &request.currency)?;
        let params = [
            ("amount", amount.to_string()),
            ("currency", request.currency.to_lowercase()),
            ("customer", request.customer_ref.clone()),
            ("payment_method", request.payment_method_ref.clone()),
            ("confirm", "true".to_string()),
            ("off_session", "true".to_string()),
            ("description", request.description.clone()),
            ("metadata[invoice_id]", request.invoice_id.to_string()),
            ("metadata[idempotency_key]", request.idempotency_key.clone()),
        ];

        let url = format!("{}/v1/payment_intents", self.config.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| transport_error(Provider::Stripe, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::Stripe, e))?;

        tracing::debug!(status = %status, "Stripe payment_intents response");

        if status.is_success() {
            let intent: PaymentIntent = serde_json::from_str(&body)
                .map_err(|e| ProviderError::InvalidResponse(format!("payment intent: {}", e)))?;
            return match intent.status.as_str() {
                // processing settles asynchronously; a later webhook marks failures
                "succeeded" | "processing" => Ok(ChargeOutcome::Approved {
                    provider_payment_ref: intent.id,
                }),
                "requires_action" => Ok(ChargeOutcome::Declined {
                    code: "authentication_required".to_string(),
                    message: "Payment requires customer authentication".to_string(),
                    retryable: false,
                }),
                "requires_payment_method" => Ok(intent
                    .last_payment_error
                    .as_ref()
                    .map(Self::decline)
                    .unwrap_or(ChargeOutcome::Declined {
                        code: "card_declined".to_string(),
                        message: "Payment method was declined".to_string(),
                        retryable: true,
                    })),
                other => Err(ProviderError::InvalidResponse(format!(
                    "Unexpected payment intent status: {}",
                    other
                ))),
            };
        }

        if status == StatusCode::PAYMENT_REQUIRED {
            let envelope: StripeErrorEnvelope = serde_json::from_str(&body)
                .map_err(|e| ProviderError::InvalidResponse(format!("card error: {}", e)))?;
            tracing::info!(
                error_type = ?envelope.error.error_type,
                code = ?envelope.error.code,
                decline_code = ?envelope.error.decline_code,
                "Stripe declined charge"
            );
            return Ok(Self::decline(&envelope.error));
        }

        Err(status_error(Provider::Stripe, status, &body))
    }

    async fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let header = header_str(headers, "stripe-signature").ok_or_else(|| {
            ProviderError::InvalidSignature("Missing Stripe-Signature header".to_string())
        })?;

        verify_signature(
            header,
            body,
            self.config.webhook_secret.expose_secret(),
            chrono::Utc::now().timestamp(),
        )?;

        parse_event(body)
    }
}

/// Verify a `t=<unix>,v1=<hex>[,v1=<hex>...]` header against the raw body.
pub fn verify_signature(
    header: &str,
    body: &[u8],
    secret: &str,
    now_unix: i64,
) -> Result<(), ProviderError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| ProviderError::InvalidSignature("Missing timestamp".to_string()))?;
    if signatures.is_empty() {
        return Err(ProviderError::InvalidSignature(
            "Missing v1 signature".to_string(),
        ));
    }
    let within_tolerance = now_unix
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|skew| skew <= SIGNATURE_TOLERANCE_SECS as u64);
    if !within_tolerance {
        return Err(ProviderError::InvalidSignature(
            "Timestamp outside tolerance".to_string(),
        ));
    }

    let mut payload = format!("{}.", timestamp).into_bytes();
    payload.extend_from_slice(body);
    let expected = hmac_sha256_hex(secret.as_bytes(), &payload)
        .map_err(|e| ProviderError::InvalidSignature(e.to_string()))?;

    if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        Ok(())
    } else {
        Err(ProviderError::InvalidSignature(
            "No matching v1 signature".to_string(),
        ))
    }
}

fn parse_event(body: &[u8]) -> Result<ProviderEvent, ProviderError> {
    let event: StripeEvent = serde_json::from_slice(body)
        .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;

    let object_str = |field: &str| {
        event
            .data
            .object
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };

    let kind = match event.event_type.as_str() {
        "payment_intent.succeeded" => object_str("id").map(ProviderEventKind::PaymentSucceeded),
        "payment_intent.payment_failed" => object_str("id").map(ProviderEventKind::PaymentFailed),
        "charge.refunded" => object_str("payment_intent").map(ProviderEventKind::PaymentRefunded),
        _ => None,
    }
    .unwrap_or(ProviderEventKind::Ignored);

    Ok(ProviderEvent {
        event_id: event.id,
        event_type: event.event_type,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use secrecy::Secret;
    use std::str::FromStr;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "whsec_test";

    fn sign(body: &[u8], secret: &str, t: i64) -> String {
        let mut payload = format!("{}.", t).into_bytes();
        payload.extend_from_slice(body);
        format!("t={},v1={}", t, hmac_sha256_hex(secret.as_bytes(), &payload).unwrap())
    }

    fn provider(base: &str) -> StripeProvider {
        StripeProvider::new(
            StripeConfig {
                secret_key: Secret::new("sk_test".to_string()),
                webhook_secret: Secret::new(SECRET.to_string()),
                api_base: base.to_string(),
            },
            Client::new(),
        )
    }

    fn request() -> ChargeRequest {
        ChargeRequest {
            idempotency_key: "sub:20250101:1".to_string(),
            amount: Decimal::from_str("12.34").unwrap(),
            currency: "USD".to_string(),
            customer_ref: "cus_123".to_string(),
            payment_method_ref: "pm_123".to_string(),
            description: "Gold membership".to_string(),
            invoice_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(body, SECRET, now);
        assert!(verify_signature(&header, body, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_any_v1_may_match() {
        let body = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let good = sign(body, SECRET, now);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1=deadbeef,v1={}", now, good_sig);
        assert!(verify_signature(&header, body, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let now = 1_700_000_000;
        let header = sign(br#"{"amount":100}"#, SECRET, now);
        let result = verify_signature(&header, br#"{"amount":999}"#, SECRET, now);
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(body, "whsec_other", now);
        assert!(verify_signature(&header, body, SECRET, now).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let t = 1_700_000_000;
        let header = sign(body, SECRET, t);
        assert!(verify_signature(&header, body, SECRET, t + SIGNATURE_TOLERANCE_SECS + 1).is_err());
        assert!(verify_signature(&header, body, SECRET, t + SIGNATURE_TOLERANCE_SECS).is_ok());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let body = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        for t in [i64::MIN, i64::MAX, -1] {
            let header = format!("t={},v1=00", t);
            let result = verify_signature(&header, body, SECRET, now);
            assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
        }
        let header = sign(body, SECRET, i64::MIN);
        assert!(verify_signature(&header, body, SECRET, i64::MAX).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature("garbage", b"{}", SECRET, 0).is_err());
        assert!(verify_signature("t=1", b"{}", SECRET, 1).is_err());
    }

    #[test]
    fn test_parse_refund_event() {
        let body = br#"{"id":"evt_9","type":"charge.refunded","data":{"object":{"id":"ch_1","payment_intent":"pi_42"}}}"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.event_id, "evt_9");
        assert_eq!(
            event.kind,
            ProviderEventKind::PaymentRefunded("pi_42".to_string())
        );
    }

    #[test]
    fn test_parse_unhandled_event_is_ignored() {
        let body = br#"{"id":"evt_2","type":"customer.created","data":{"object":{"id":"cus_1"}}}"#;
        assert_eq!(parse_event(body).unwrap().kind, ProviderEventKind::Ignored);
    }

    #[tokio::test]
    async fn test_charge_approved_forwards_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header("Idempotency-Key", "sub:20250101:1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "pi_1", "status": "succeeded"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Approved {
                provider_payment_ref: "pi_1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_charge_card_declined() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(ResponseTemplate::new(402).set_body_json(serde_json::json!({
                "error": {
                    "type": "card_error",
                    "code": "card_declined",
                    "decline_code": "insufficient_funds",
                    "message": "Your card has insufficient funds."
                }
            })))
            .mount(&server)
            .await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Declined {
                code: "insufficient_funds".to_string(),
                message: "Your card has insufficient funds.".to_string(),
                retryable: true,
            }
        );
    }

    #[tokio::test]
    async fn test_charge_hard_decline_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .respond_with(ResponseTemplate::new(402).set_body_json(serde_json::json!({
                "error": {"type": "card_error", "code": "expired_card", "message": "Expired"}
            })))
            .mount(&server)
            .await;

        match provider(&server.uri()).charge(&request()).await.unwrap() {
            ChargeOutcome::Declined { retryable, code, .. } => {
                assert_eq!(code, "expired_card");
                assert!(!retryable);
            }
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_charge_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[tokio::test]
    async fn test_charge_bad_request_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"type": "invalid_request_error", "message": "No such customer"}
            })))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_parse_webhook_requires_header() {
        let result = provider("http://unused")
            .parse_webhook(&HeaderMap::new(), b"{}")
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidSignature(_))));
    }
}
