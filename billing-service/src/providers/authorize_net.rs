//! Authorize.Net adapter.
//!
//! Charges customer payment profiles with `createTransactionRequest` and
//! verifies `X-ANET-Signature` webhook headers. A duplicate-window hit is
//! resolved against the original transaction with
//! `getTransactionDetailsRequest`.

use super::{
    format_major_units, header_str, status_error, transport_error, ChargeOutcome, ChargeRequest,
    PaymentProvider, Provider, ProviderError, ProviderEvent, ProviderEventKind,
};
use crate::config::AuthorizeNetConfig;
use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use service_core::utils::signature::verify_hmac_sha512;
use sha2::{Digest, Sha256};

/// Authorize.Net limits `refId` and `invoiceNumber` to 20 characters.
const REF_ID_LEN: usize = 20;

/// "A duplicate transaction has been submitted."
const DUPLICATE_TRANSACTION: &str = "11";

pub struct AuthorizeNetProvider {
    http: Client,
    config: AuthorizeNetConfig,
}

// Authorize.Net validates JSON against its XML schema, so field order matters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransactionEnvelope<'a> {
    create_transaction_request: CreateTransactionRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransactionRequest<'a> {
    merchant_authentication: MerchantAuthentication<'a>,
    ref_id: String,
    transaction_request: TransactionRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MerchantAuthentication<'a> {
    name: &'a str,
    transaction_key: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRequest<'a> {
    transaction_type: &'static str,
    amount: String,
    currency_code: String,
    profile: CustomerProfilePayment<'a>,
    order: OrderInfo,
    transaction_settings: TransactionSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomerProfilePayment<'a> {
    customer_profile_id: &'a str,
    payment_profile: PaymentProfile<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentProfile<'a> {
    payment_profile_id: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderInfo {
    invoice_number: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct TransactionSettings {
    setting: Vec<Setting>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setting {
    setting_name: &'static str,
    setting_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionEnvelope {
    transaction_response: Option<TransactionResponse>,
    messages: Messages,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionResponse {
    response_code: Option<String>,
    trans_id: Option<String>,
    #[serde(default)]
    errors: Vec<TransactionError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionError {
    error_code: String,
    error_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Messages {
    result_code: String,
    #[serde(default)]
    message: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    code: String,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetailsEnvelope<'a> {
    get_transaction_details_request: TransactionDetailsRequest<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetailsRequest<'a> {
    merchant_authentication: MerchantAuthentication<'a>,
    trans_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetailsResponse {
    transaction: Option<TransactionDetails>,
    messages: Messages,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionDetails {
    trans_id: String,
    response_code: i64,
    response_reason_code: Option<i64>,
    response_reason_description: Option<String>,
}

/// What a `createTransactionRequest` response says about the attempt.
#[derive(Debug, PartialEq)]
enum Interpretation {
    Settled(ChargeOutcome),
    /// Error 11 inside the duplicate window. Carries the original `transId`,
    /// whose own result decides the outcome.
    Duplicate(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnetEvent {
    notification_id: String,
    event_type: String,
    payload: AnetEventPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnetEventPayload {
    id: String,
    response_code: Option<i64>,
}

/// Deterministic 20-character reference for an idempotency key.
pub fn short_ref(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    digest[..REF_ID_LEN].to_string()
}

impl AuthorizeNetProvider {
    pub fn new(config: AuthorizeNetConfig, http: Client) -> Self {
        Self { http, config }
    }

    fn authentication(&self) -> MerchantAuthentication<'_> {
        MerchantAuthentication {
            name: &self.config.api_login_id,
            transaction_key: self.config.transaction_key.expose_secret(),
        }
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        envelope: &B,
        operation: &str,
    ) -> Result<R, ProviderError> {
        let response = self
            .http
            .post(&self.config.api_url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| transport_error(Provider::AuthorizeNet, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(Provider::AuthorizeNet, e))?;

        if !status.is_success() {
            return Err(status_error(Provider::AuthorizeNet, status, &body));
        }

        // Responses are prefixed with a UTF-8 byte order mark
        let body = body.trim_start_matches('\u{feff}');
        serde_json::from_str(body)
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", operation, e)))
    }

    /// Look up the transaction a duplicate submission matched.
    async fn resolve_duplicate(&self, trans_id: &str) -> Result<ChargeOutcome, ProviderError> {
        let envelope = TransactionDetailsEnvelope {
            get_transaction_details_request: TransactionDetailsRequest {
                merchant_authentication: self.authentication(),
                trans_id,
            },
        };
        let response: TransactionDetailsResponse =
            self.post(&envelope, "transaction details").await?;

        tracing::info!(
            trans_id = %trans_id,
            result_code = %response.messages.result_code,
            "Resolved Authorize.Net duplicate transaction"
        );

        Self::interpret_details(response)
    }

    fn interpret_details(response: TransactionDetailsResponse) -> Result<ChargeOutcome, ProviderError> {
        // Without the original the outcome is unknown, so retry with the same key
        let Some(tx) = response.transaction else {
            let text = response
                .messages
                .message
                .first()
                .map(|m| format!("{}: {}", m.code, m.text))
                .unwrap_or_else(|| "no message".to_string());
            return Err(ProviderError::Transient(format!(
                "Original of duplicate transaction not found ({})",
                text
            )));
        };

        let code = tx
            .response_reason_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| tx.response_code.to_string());
        let message = tx
            .response_reason_description
            .unwrap_or_else(|| "Original transaction was not approved".to_string());

        match tx.response_code {
            1 | 4 => Ok(ChargeOutcome::Approved {
                provider_payment_ref: tx.trans_id,
            }),
            2 => Ok(ChargeOutcome::Declined {
                code,
                message,
                retryable: true,
            }),
            3 => Ok(ChargeOutcome::Declined {
                code,
                message,
                retryable: false,
            }),
            other => Err(ProviderError::InvalidResponse(format!(
                "Unexpected original responseCode {}",
                other
            ))),
        }
    }

    fn interpret(envelope: TransactionEnvelope) -> Result<Interpretation, ProviderError> {
        let Some(tx) = envelope.transaction_response else {
            let first = envelope.messages.message.first();
            let code = first.map(|m| m.code.as_str()).unwrap_or("unknown");
            let text = first.map(|m| m.text.as_str()).unwrap_or("no message");
            // E00001 is an unexpected system error on their side
            return Err(if code == "E00001" {
                ProviderError::Transient(format!("Authorize.Net {}: {}", code, text))
            } else {
                ProviderError::Rejected(format!(
                    "Authorize.Net {} ({}): {}",
                    envelope.messages.result_code, code, text
                ))
            });
        };

        let trans_id = tx.trans_id.filter(|id| !id.is_empty() && id != "0");
        let error = tx.errors.first();
        let error_code = error.map(|e| e.error_code.clone());
        let error_text = error.map(|e| e.error_text.clone());

        match tx.response_code.as_deref() {
            // 4 = held for review; money is authorised
            Some("1") | Some("4") => trans_id
                .map(|id| {
                    Interpretation::Settled(ChargeOutcome::Approved {
                        provider_payment_ref: id,
                    })
                })
                .ok_or_else(|| {
                    ProviderError::InvalidResponse("Approved without transId".to_string())
                }),
            Some("2") => Ok(Interpretation::Settled(ChargeOutcome::Declined {
                code: error_code.unwrap_or_else(|| "2".to_string()),
                message: error_text.unwrap_or_else(|| "This transaction has been declined.".to_string()),
                retryable: true,
            })),
            Some("3") if error_code.as_deref() == Some(DUPLICATE_TRANSACTION) => trans_id
                .map(Interpretation::Duplicate)
                .ok_or_else(|| {
                    ProviderError::Transient(
                        "Duplicate transaction without original transId".to_string(),
                    )
                }),
            Some("3") => Ok(Interpretation::Settled(ChargeOutcome::Declined {
                code: error_code.unwrap_or_else(|| "3".to_string()),
                message: error_text.unwrap_or_else(|| "Transaction error".to_string()),
                retryable: false,
            })),
            other => Err(ProviderError::InvalidResponse(format!(
                "Unexpected responseCode {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
impl PaymentProvider for AuthorizeNetProvider {
    fn provider(&self) -> Provider {
        Provider::AuthorizeNet
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        // The duplicate window matches on invoice number, so only a resend
        // of the same attempt may collide
        let reference = short_ref(&request.idempotency_key);
        let envelope = CreateTransactionEnvelope {
            create_transaction_request: CreateTransactionRequest {
                merchant_authentication: self.authentication(),
                ref_id: reference.clone(),
                transaction_request: TransactionRequest {
                    transaction_type: "authCaptureTransaction",
                    amount: format_major_units(request.amount),
                    currency_code: request.currency.to_uppercase(),
                    profile: CustomerProfilePayment {
                        customer_profile_id: &request.customer_ref,
                        payment_profile: PaymentProfile {
                            payment_profile_id: &request.payment_method_ref,
                        },
                    },
                    order: OrderInfo {
                        invoice_number: reference,
                        description: request.description.chars().take(255).collect(),
                    },
                    transaction_settings: TransactionSettings {
                        setting: vec![Setting {
                            setting_name: "duplicateWindow",
                            setting_value: self.config.duplicate_window_secs.to_string(),
                        }],
                    },
                },
            },
        };

        let response: TransactionEnvelope = self.post(&envelope, "transaction").await?;

        tracing::debug!(
            result_code = %response.messages.result_code,
            "Authorize.Net createTransaction response"
        );

        match Self::interpret(response)? {
            Interpretation::Settled(outcome) => Ok(outcome),
            Interpretation::Duplicate(original) => self.resolve_duplicate(&original).await,
        }
    }

    async fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let header = header_str(headers, "x-anet-signature").ok_or_else(|| {
            ProviderError::InvalidSignature("Missing X-ANET-Signature header".to_string())
        })?;

        verify_signature(header, body, self.config.signature_key.expose_secret())?;

        let event: AnetEvent = serde_json::from_slice(body)
            .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;

        let id = event.payload.id.clone();
        let kind = match event.event_type.as_str() {
            "net.authorize.payment.authcapture.created" | "net.authorize.payment.capture.created" => {
                match event.payload.response_code {
                    None | Some(1) | Some(4) => ProviderEventKind::PaymentSucceeded(id),
                    Some(_) => ProviderEventKind::PaymentFailed(id),
                }
            }
            "net.authorize.payment.fraud.declined" => ProviderEventKind::PaymentFailed(id),
            "net.authorize.payment.refund.created" | "net.authorize.payment.void.created" => {
                ProviderEventKind::PaymentRefunded(id)
            }
            _ => ProviderEventKind::Ignored,
        };

        Ok(ProviderEvent {
            event_id: event.notification_id,
            event_type: event.event_type,
            kind,
        })
    }
}

/// Verify `sha512=<HEX>`; hex case is not significant.
pub fn verify_signature(header: &str, body: &[u8], signature_key: &str) -> Result<(), ProviderError> {
    let header = header.trim();
    let signature = header
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("sha512="))
        .map(|_| &header[7..])
        .ok_or_else(|| ProviderError::InvalidSignature("Expected sha512= prefix".to_string()))?;

    let valid = verify_hmac_sha512(signature_key.as_bytes(), body, signature)
        .map_err(|e| ProviderError::InvalidSignature(e.to_string()))?;

    if valid {
        Ok(())
    } else {
        Err(ProviderError::InvalidSignature(
            "Signature mismatch".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use secrecy::Secret;
    use service_core::utils::signature::hmac_sha512_hex;
    use uuid::Uuid;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SIGNATURE_KEY: &str = "4C5D6E7F";

    fn provider(api_url: &str) -> AuthorizeNetProvider {
        AuthorizeNetProvider::new(
            AuthorizeNetConfig {
                api_login_id: "login".to_string(),
                transaction_key: Secret::new("txkey".to_string()),
                signature_key: Secret::new(SIGNATURE_KEY.to_string()),
                api_url: api_url.to_string(),
                duplicate_window_secs: 28800,
            },
            Client::new(),
        )
    }

    fn request() -> ChargeRequest {
        ChargeRequest {
            idempotency_key: "order:1234".to_string(),
            amount: Decimal::from(40),
            currency: "USD".to_string(),
            customer_ref: "1500001".to_string(),
            payment_method_ref: "1400001".to_string(),
            description: "Lifetime pass".to_string(),
            invoice_id: Uuid::new_v4(),
        }
    }

    fn approved_body() -> String {
        format!(
            "\u{feff}{}",
            serde_json::json!({
                "transactionResponse": {"responseCode": "1", "transId": "60012345678"},
                "refId": "abc",
                "messages": {"resultCode": "Ok", "message": [{"code": "I00001", "text": "Successful."}]}
            })
        )
    }

    #[test]
    fn test_short_ref_is_stable_and_bounded() {
        assert_eq!(short_ref("sub:20250101:1"), short_ref("sub:20250101:1"));
        assert_ne!(short_ref("sub:20250101:1"), short_ref("sub:20250101:2"));
        assert_eq!(short_ref("anything").len(), 20);
    }

    #[test]
    fn test_signature_case_insensitive() {
        let body = br#"{"notificationId":"n1"}"#;
        let sig = hmac_sha512_hex(SIGNATURE_KEY.as_bytes(), body).unwrap();
        assert!(verify_signature(&format!("sha512={}", sig.to_uppercase()), body, SIGNATURE_KEY).is_ok());
        assert!(verify_signature(&format!("SHA512={}", sig), body, SIGNATURE_KEY).is_ok());
    }

    #[test]
    fn test_signature_tampered_or_wrong_key() {
        let body = br#"{"notificationId":"n1"}"#;
        let sig = hmac_sha512_hex(SIGNATURE_KEY.as_bytes(), body).unwrap();
        let header = format!("sha512={}", sig);
        assert!(verify_signature(&header, br#"{"notificationId":"n2"}"#, SIGNATURE_KEY).is_err());
        assert!(verify_signature(&header, body, "OTHERKEY").is_err());
        assert!(verify_signature(&sig, body, SIGNATURE_KEY).is_err());
    }

    #[tokio::test]
    async fn test_charge_approved_with_bom() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "createTransactionRequest": {
                    "refId": short_ref("order:1234"),
                    "transactionRequest": {"amount": "40.00"}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(approved_body()))
            .mount(&server)
            .await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Approved {
                provider_payment_ref: "60012345678".to_string()
            }
        );
    }

    #[test]
    fn test_interpret_decline() {
        let envelope: TransactionEnvelope = serde_json::from_value(serde_json::json!({
            "transactionResponse": {
                "responseCode": "2",
                "transId": "0",
                "errors": [{"errorCode": "2", "errorText": "This transaction has been declined."}]
            },
            "messages": {"resultCode": "Error", "message": [{"code": "E00027", "text": "The transaction was unsuccessful."}]}
        }))
        .unwrap();
        assert_eq!(
            AuthorizeNetProvider::interpret(envelope).unwrap(),
            Interpretation::Settled(ChargeOutcome::Declined {
                code: "2".to_string(),
                message: "This transaction has been declined.".to_string(),
                retryable: true,
            })
        );
    }

    fn duplicate_body() -> serde_json::Value {
        serde_json::json!({
            "transactionResponse": {
                "responseCode": "3",
                "transId": "60099999999",
                "errors": [{"errorCode": "11", "errorText": "A duplicate transaction has been submitted."}]
            },
            "messages": {"resultCode": "Error", "message": []}
        })
    }

    fn details_body(response_code: i64, reason_code: i64, reason: &str) -> serde_json::Value {
        serde_json::json!({
            "transaction": {
                "transId": "60099999999",
                "responseCode": response_code,
                "responseReasonCode": reason_code,
                "responseReasonDescription": reason,
                "transactionStatus": "declined"
            },
            "messages": {"resultCode": "Ok", "message": [{"code": "I00001", "text": "Successful."}]}
        })
    }

    async fn mount_duplicate(server: &MockServer, details: serde_json::Value) {
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"createTransactionRequest": {}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(duplicate_body()))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "getTransactionDetailsRequest": {"transId": "60099999999"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(details))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn test_interpret_duplicate_defers_to_original() {
        let envelope: TransactionEnvelope = serde_json::from_value(duplicate_body()).unwrap();
        assert_eq!(
            AuthorizeNetProvider::interpret(envelope).unwrap(),
            Interpretation::Duplicate("60099999999".to_string())
        );
    }

    #[tokio::test]
    async fn test_duplicate_of_declined_original_is_declined() {
        let server = MockServer::start().await;
        mount_duplicate(&server, details_body(2, 2, "This transaction has been declined.")).await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Declined {
                code: "2".to_string(),
                message: "This transaction has been declined.".to_string(),
                retryable: true,
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_of_approved_original_is_approved() {
        let server = MockServer::start().await;
        mount_duplicate(&server, details_body(1, 1, "This transaction has been approved.")).await;

        let outcome = provider(&server.uri()).charge(&request()).await.unwrap();
        assert_eq!(
            outcome,
            ChargeOutcome::Approved {
                provider_payment_ref: "60099999999".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_with_missing_original_is_transient() {
        let server = MockServer::start().await;
        mount_duplicate(
            &server,
            serde_json::json!({
                "messages": {"resultCode": "Error", "message": [{"code": "E00040", "text": "The record cannot be found."}]}
            }),
        )
        .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[tokio::test]
    async fn test_invoice_number_follows_attempt_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "createTransactionRequest": {
                    "transactionRequest": {"order": {"invoiceNumber": short_ref("order:1234")}}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string(approved_body()))
            .expect(1)
            .mount(&server)
            .await;

        provider(&server.uri()).charge(&request()).await.unwrap();
    }

    #[test]
    fn test_interpret_auth_failure_rejected() {
        let envelope: TransactionEnvelope = serde_json::from_value(serde_json::json!({
            "messages": {"resultCode": "Error", "message": [{"code": "E00007", "text": "User authentication failed."}]}
        }))
        .unwrap();
        assert!(matches!(
            AuthorizeNetProvider::interpret(envelope),
            Err(ProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_charge_gateway_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let result = provider(&server.uri()).charge(&request()).await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[tokio::test]
    async fn test_parse_webhook_capture() {
        let body = serde_json::to_vec(&serde_json::json!({
            "notificationId": "d0e8e7fe-c3e7-4add-a480-27bc5ce28a88",
            "eventType": "net.authorize.payment.authcapture.created",
            "eventDate": "2025-01-01T00:00:00.000Z",
            "webhookId": "w1",
            "payload": {"responseCode": 1, "authAmount": 40.0, "entityName": "transaction", "id": "60012345678"}
        }))
        .unwrap();
        let sig = hmac_sha512_hex(SIGNATURE_KEY.as_bytes(), &body).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("X-ANET-Signature", format!("sha512={}", sig.to_uppercase()).parse().unwrap());

        let event = provider("http://unused")
            .parse_webhook(&headers, &body)
            .await
            .unwrap();
        assert_eq!(event.event_id, "d0e8e7fe-c3e7-4add-a480-27bc5ce28a88");
        assert_eq!(
            event.kind,
            ProviderEventKind::PaymentSucceeded("60012345678".to_string())
        );
    }
}
