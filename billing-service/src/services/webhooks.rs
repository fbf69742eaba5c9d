//! Provider webhook intake.

use crate::models::Provider;
use crate::providers::ProviderRegistry;
use crate::services::metrics::record_webhook_event;
use crate::services::store::{BillingStore, WebhookApplication};
use axum::http::HeaderMap;
use chrono::Utc;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    providers: Arc<ProviderRegistry>,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn BillingStore>, providers: Arc<ProviderRegistry>) -> Self {
        Self { store, providers }
    }

    /// Verify, dedupe and apply one delivery.
    #[instrument(skip(self, headers, body), fields(provider = %provider, body_len = body.len()))]
    pub async fn process(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookApplication, AppError> {
        let adapter = self.providers.get(provider)?;

        let event = match adapter.parse_webhook(headers, body).await {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Webhook rejected");
                record_webhook_event(provider.as_str(), "rejected");
                return Err(e.into());
            }
        };

        let applied = self
            .store
            .apply_webhook_event(provider, &event, Utc::now())
            .await?;
        record_webhook_event(provider.as_str(), applied.as_str());

        match applied {
            WebhookApplication::UnknownReference => warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Webhook references an unknown payment"
            ),
            _ => info!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                result = applied.as_str(),
                "Webhook processed"
            ),
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::{MOCK_SIGNATURE_HEADER, MOCK_WEBHOOK_SECRET};
    use crate::providers::MockProvider;
    use crate::services::memory::MemoryStore;
    use service_core::utils::signature::hmac_sha256_hex;

    fn processor() -> WebhookProcessor {
        let registry =
            ProviderRegistry::new().with(Arc::new(MockProvider::for_provider(Provider::Stripe)));
        WebhookProcessor::new(Arc::new(MemoryStore::new()), Arc::new(registry))
    }

    fn signed(body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let signature = hmac_sha256_hex(MOCK_WEBHOOK_SECRET.as_bytes(), body.as_bytes()).unwrap();
        headers.insert(MOCK_SIGNATURE_HEADER, signature.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn test_repeated_event_is_duplicate() {
        let processor = processor();
        let body = r#"{"id":"evt_1","type":"payment.succeeded","payment_ref":"pi_unknown"}"#;

        let first = processor
            .process(Provider::Stripe, &signed(body), body.as_bytes())
            .await
            .unwrap();
        assert_eq!(first, WebhookApplication::UnknownReference);

        let second = processor
            .process(Provider::Stripe, &signed(body), body.as_bytes())
            .await
            .unwrap();
        assert_eq!(second, WebhookApplication::Duplicate);
    }

    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let processor = processor();
        let body = r#"{"id":"evt_2","type":"payment.failed","payment_ref":"pi_1"}"#;
        let err = processor
            .process(Provider::Stripe, &signed("tampered"), body.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_unavailable() {
        let processor = processor();
        let err = processor
            .process(Provider::Paypal, &HeaderMap::new(), b"{}")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable));
    }
}
