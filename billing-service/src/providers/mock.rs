//! Scripted provider for tests and local development.
//!
//! Behaves like a real processor with respect to idempotency: a repeated
//! idempotency key replays the recorded outcome without charging again.

use super::{
    header_str, ChargeOutcome, ChargeRequest, PaymentProvider, Provider, ProviderError,
    ProviderEvent, ProviderEventKind,
};
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use service_core::utils::signature::verify_hmac_sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const MOCK_SIGNATURE_HEADER: &str = "x-mock-signature";
pub const MOCK_WEBHOOK_SECRET: &str = "mock-webhook-secret";

/// Next scripted response. An empty script approves.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Approve,
    Decline { code: String, retryable: bool },
    Transient,
}

impl MockResponse {
    pub fn decline(code: &str) -> Self {
        MockResponse::Decline {
            code: code.to_string(),
            retryable: true,
        }
    }

    pub fn hard_decline(code: &str) -> Self {
        MockResponse::Decline {
            code: code.to_string(),
            retryable: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockResponse>,
    recorded: HashMap<String, ChargeOutcome>,
    requests: Vec<ChargeRequest>,
}

pub struct MockProvider {
    provider: Provider,
    latency: Duration,
    state: Mutex<MockState>,
    calls: AtomicUsize,
    charges: AtomicUsize,
}

#[derive(Debug, Deserialize)]
struct MockEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    payment_ref: Option<String>,
}

impl MockProvider {
    pub fn for_provider(provider: Provider) -> Self {
        Self {
            provider,
            latency: Duration::ZERO,
            state: Mutex::new(MockState::default()),
            calls: AtomicUsize::new(0),
            charges: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, response: MockResponse) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(response);
        }
    }

    /// Calls received, including replays and transient failures.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Charges actually performed (approved or declined).
    pub fn charge_count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ChargeRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| ProviderError::Transient("mock state poisoned".to_string()))?;
        state.requests.push(request.clone());

        if let Some(outcome) = state.recorded.get(&request.idempotency_key) {
            return Ok(outcome.clone());
        }

        let outcome = match state.script.pop_front().unwrap_or(MockResponse::Approve) {
            MockResponse::Transient => {
                return Err(ProviderError::Transient("scripted transient".to_string()))
            }
            MockResponse::Approve => {
                let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
                ChargeOutcome::Approved {
                    provider_payment_ref: format!("mock_{}_{}", self.provider, n),
                }
            }
            MockResponse::Decline { code, retryable } => {
                self.charges.fetch_add(1, Ordering::SeqCst);
                ChargeOutcome::Declined {
                    message: format!("Scripted decline: {}", code),
                    code,
                    retryable,
                }
            }
        };

        state
            .recorded
            .insert(request.idempotency_key.clone(), outcome.clone());
        Ok(outcome)
    }

    async fn parse_webhook(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<ProviderEvent, ProviderError> {
        let signature = header_str(headers, MOCK_SIGNATURE_HEADER).ok_or_else(|| {
            ProviderError::InvalidSignature(format!("Missing {} header", MOCK_SIGNATURE_HEADER))
        })?;
        let valid = verify_hmac_sha256(MOCK_WEBHOOK_SECRET.as_bytes(), body, signature)
            .map_err(|e| ProviderError::InvalidSignature(e.to_string()))?;
        if !valid {
            return Err(ProviderError::InvalidSignature(
                "Signature mismatch".to_string(),
            ));
        }

        let event: MockEvent = serde_json::from_slice(body)
            .map_err(|e| ProviderError::InvalidPayload(e.to_string()))?;
        let kind = match (event.event_type.as_str(), event.payment_ref) {
            ("payment.succeeded", Some(r)) => ProviderEventKind::PaymentSucceeded(r),
            ("payment.failed", Some(r)) => ProviderEventKind::PaymentFailed(r),
            ("payment.refunded", Some(r)) => ProviderEventKind::PaymentRefunded(r),
            _ => ProviderEventKind::Ignored,
        };

        Ok(ProviderEvent {
            event_id: event.id,
            event_type: event.event_type,
            kind,
        })
    }
}
