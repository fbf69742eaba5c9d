//! Revenue and MRR snapshots.

use crate::models::{start_of_day, AnalyticsSnapshot, MetricType};
use crate::services::store::BillingStore;
use chrono::{Days, NaiveDate};
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

pub struct AnalyticsService {
    store: Arc<dyn BillingStore>,
}

impl AnalyticsService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Net revenue settled on `date`. A closed day is served from the cache
    /// only when the cached value was computed after the day ended; anything
    /// else, `today` included, is recomputed.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, date = %date))]
    pub async fn daily_revenue(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        currency: &str,
        today: NaiveDate,
    ) -> Result<AnalyticsSnapshot, AppError> {
        if date > today {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Revenue date {} is in the future",
                date
            )));
        }
        let currency = currency.to_ascii_uppercase();

        if date < today {
            let closed_at = date.checked_add_days(Days::new(1)).map(start_of_day);
            if let Some(cached) = self
                .store
                .get_snapshot(tenant_id, date, MetricType::DailyRevenue, &currency)
                .await?
            {
                if closed_at.is_some_and(|closed| cached.computed_utc >= closed) {
                    debug!("Serving cached revenue snapshot");
                    return Ok(cached);
                }
                debug!(computed_utc = %cached.computed_utc, "Cached revenue predates day close");
            }
        }

        let (value, sample_count) = self
            .store
            .revenue_for_date(tenant_id, date, &currency)
            .await?;
        self.store
            .upsert_snapshot(
                tenant_id,
                date,
                MetricType::DailyRevenue,
                &currency,
                value,
                sample_count,
            )
            .await
    }

    /// Current MRR, stored as today's snapshot.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn mrr(
        &self,
        tenant_id: Uuid,
        currency: &str,
        today: NaiveDate,
    ) -> Result<AnalyticsSnapshot, AppError> {
        let currency = currency.to_ascii_uppercase();
        let (value, sample_count) = self.store.mrr(tenant_id, &currency).await?;
        self.store
            .upsert_snapshot(tenant_id, today, MetricType::Mrr, &currency, value, sample_count)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BillingInterval, CreateCustomer, CreateMembershipType, CreateSubscription, Provider,
    };
    use crate::services::memory::MemoryStore;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    async fn subscribe(
        store: &MemoryStore,
        tenant_id: Uuid,
        amount: Decimal,
        interval: BillingInterval,
    ) {
        let customer = store
            .create_customer(&CreateCustomer {
                tenant_id,
                user_id: Some(Uuid::new_v4()),
                guest_email: None,
                display_name: None,
                provider: Provider::Stripe,
                provider_customer_ref: format!("cus_{}", Uuid::new_v4().simple()),
            })
            .await
            .unwrap();
        let membership_type = store
            .create_membership_type(&CreateMembershipType {
                tenant_id,
                name: format!("Plan {}", Uuid::new_v4().simple()),
                description: None,
                features: vec![],
                price: amount,
                currency: "USD".to_string(),
                billing_interval: interval,
                interval_count: 1,
                is_recurring: true,
                duration_days: None,
            })
            .await
            .unwrap();
        store
            .create_subscription(&CreateSubscription {
                tenant_id,
                customer_id: customer.customer_id,
                membership_type_id: membership_type.membership_type_id,
                payment_method_id: None,
                amount,
                currency: "USD".to_string(),
                billing_interval: interval,
                interval_count: 1,
                start_date: Utc::now().date_naive(),
                trial_end_date: None,
                max_retry_attempts: 3,
                metadata: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mrr_normalises_intervals() {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        subscribe(&store, tenant_id, Decimal::from(10), BillingInterval::Monthly).await;
        subscribe(&store, tenant_id, Decimal::from(120), BillingInterval::Annually).await;
        let service = AnalyticsService::new(store.clone());

        let snapshot = service
            .mrr(tenant_id, "usd", Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(snapshot.value, Decimal::from_str("20.00").unwrap());
        assert_eq!(snapshot.sample_count, 2);
        assert_eq!(snapshot.currency, "USD");
    }

    #[tokio::test]
    async fn test_past_revenue_served_from_cache() {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let yesterday = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(1))
            .unwrap();
        store
            .upsert_snapshot(
                tenant_id,
                yesterday,
                MetricType::DailyRevenue,
                "USD",
                Decimal::from(99),
                3,
            )
            .await
            .unwrap();
        let service = AnalyticsService::new(store.clone());

        let snapshot = service
            .daily_revenue(tenant_id, yesterday, "USD", Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(snapshot.value, Decimal::from(99));

        let today = service
            .daily_revenue(tenant_id, Utc::now().date_naive(), "USD", Utc::now().date_naive())
            .await
            .unwrap();
        assert_eq!(today.value, Decimal::ZERO);
        assert_eq!(today.sample_count, 0);
    }

    #[tokio::test]
    async fn test_snapshot_taken_before_day_close_is_recomputed() {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let day = Utc::now().date_naive();
        let partial = store
            .upsert_snapshot(
                tenant_id,
                day,
                MetricType::DailyRevenue,
                "USD",
                Decimal::from(99),
                3,
            )
            .await
            .unwrap();
        let service = AnalyticsService::new(store.clone());

        let next_day = day.checked_add_days(Days::new(1)).unwrap();
        let snapshot = service
            .daily_revenue(tenant_id, day, "USD", next_day)
            .await
            .unwrap();
        assert_eq!(snapshot.value, Decimal::ZERO);
        assert_eq!(snapshot.sample_count, 0);
        assert!(snapshot.computed_utc >= partial.computed_utc);

        let cached = store
            .get_snapshot(tenant_id, day, MetricType::DailyRevenue, "USD")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.value, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_future_revenue_rejected() {
        let service = AnalyticsService::new(Arc::new(MemoryStore::new()));
        let today = Utc::now().date_naive();
        let err = service
            .daily_revenue(
                Uuid::new_v4(),
                today.checked_add_days(Days::new(1)).unwrap(),
                "USD",
                today,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
