//! Membership access checks.

use crate::models::{BillingStatus, MembershipStatus, MembershipType, UserMembership};
use crate::services::store::BillingStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub membership_id: Option<Uuid>,
    pub membership_type_id: Option<Uuid>,
    pub expires_utc: Option<DateTime<Utc>>,
    pub reason: String,
}

impl AccessDecision {
    fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            membership_id: None,
            membership_type_id: None,
            expires_utc: None,
            reason: reason.to_string(),
        }
    }

    fn granted(membership: &UserMembership, reason: &str) -> Self {
        Self {
            allowed: true,
            membership_id: Some(membership.membership_id),
            membership_type_id: Some(membership.membership_type_id),
            expires_utc: membership.expires_utc,
            reason: reason.to_string(),
        }
    }
}

pub struct AccessService {
    store: Arc<dyn BillingStore>,
    grace: chrono::Duration,
}

impl AccessService {
    pub fn new(store: Arc<dyn BillingStore>, grace_days: i64) -> Self {
        Self {
            store,
            grace: chrono::Duration::days(grace_days.max(0)),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id, feature = %feature))]
    pub async fn verify_access(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        feature: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessDecision, AppError> {
        if self.store.get_customer(tenant_id, customer_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Customer {} not found",
                customer_id
            )));
        }

        let active: Vec<UserMembership> = self
            .store
            .list_memberships(tenant_id, customer_id)
            .await?
            .into_iter()
            .filter(|m| MembershipStatus::from_string(&m.status) == MembershipStatus::Active)
            .collect();
        if active.is_empty() {
            return Ok(AccessDecision::denied("no_active_membership"));
        }

        let mut types: HashMap<Uuid, Option<MembershipType>> = HashMap::new();
        let mut covering = Vec::new();
        for membership in active {
            if !types.contains_key(&membership.membership_type_id) {
                let membership_type = self
                    .store
                    .get_membership_type(tenant_id, membership.membership_type_id)
                    .await?;
                types.insert(membership.membership_type_id, membership_type);
            }
            let includes = types
                .get(&membership.membership_type_id)
                .and_then(|t| t.as_ref())
                .is_some_and(|t| t.has_feature(feature));
            if includes {
                covering.push(membership);
            }
        }
        if covering.is_empty() {
            return Ok(AccessDecision::denied("feature_not_included"));
        }

        // Lifetime grants win, then the latest expiry
        covering.sort_by_key(|m| std::cmp::Reverse(m.expires_utc.map_or(i64::MAX, |e| e.timestamp())));

        for membership in &covering {
            match membership.expires_utc {
                None => return Ok(AccessDecision::granted(membership, "active")),
                Some(expires) if now < expires => {
                    return Ok(AccessDecision::granted(membership, "active"))
                }
                Some(expires) => {
                    if self.in_grace(membership, expires, now).await? {
                        return Ok(AccessDecision::granted(membership, "grace_period"));
                    }
                }
            }
        }

        debug!(memberships = covering.len(), "All covering memberships expired");
        Ok(AccessDecision::denied("membership_expired"))
    }

    /// Grace applies only while the backing subscription is being dunned.
    async fn in_grace(
        &self,
        membership: &UserMembership,
        expires: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let Some(subscription_id) = membership.subscription_id else {
            return Ok(false);
        };
        if now >= expires + self.grace {
            return Ok(false);
        }
        let subscription = self
            .store
            .get_subscription(membership.tenant_id, subscription_id)
            .await?;
        Ok(subscription.is_some_and(|s| s.status() == BillingStatus::PastDue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BillingInterval, CreateCustomer, CreateMembershipType, CreateSubscription, Provider,
    };
    use crate::services::memory::MemoryStore;
    use chrono::Days;
    use rust_decimal::Decimal;

    struct Setup {
        store: Arc<MemoryStore>,
        tenant_id: Uuid,
        customer_id: Uuid,
        membership_type_id: Uuid,
    }

    async fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let tenant_id = Uuid::new_v4();
        let customer = store
            .create_customer(&CreateCustomer {
                tenant_id,
                user_id: None,
                guest_email: Some("guest@example.com".to_string()),
                display_name: None,
                provider: Provider::Stripe,
                provider_customer_ref: "cus_guest".to_string(),
            })
            .await
            .unwrap();
        let membership_type = store
            .create_membership_type(&CreateMembershipType {
                tenant_id,
                name: "Pro".to_string(),
                description: None,
                features: vec!["reports".to_string()],
                price: Decimal::from(15),
                currency: "USD".to_string(),
                billing_interval: BillingInterval::Monthly,
                interval_count: 1,
                is_recurring: true,
                duration_days: None,
            })
            .await
            .unwrap();
        Setup {
            store,
            tenant_id,
            customer_id: customer.customer_id,
            membership_type_id: membership_type.membership_type_id,
        }
    }

    /// Subscription with a 14 day trial, which grants a membership until the trial ends.
    async fn trialing(setup: &Setup) -> Uuid {
        let today = Utc::now().date_naive();
        setup
            .store
            .create_subscription(&CreateSubscription {
                tenant_id: setup.tenant_id,
                customer_id: setup.customer_id,
                membership_type_id: setup.membership_type_id,
                payment_method_id: None,
                amount: Decimal::from(15),
                currency: "USD".to_string(),
                billing_interval: BillingInterval::Monthly,
                interval_count: 1,
                start_date: today,
                trial_end_date: today.checked_add_days(Days::new(14)),
                max_retry_attempts: 3,
                metadata: None,
            })
            .await
            .unwrap()
            .subscription_id
    }

    #[tokio::test]
    async fn test_no_membership_denied() {
        let setup = setup().await;
        let service = AccessService::new(setup.store.clone(), 3);
        let decision = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", Utc::now())
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "no_active_membership");
    }

    #[tokio::test]
    async fn test_trial_membership_grants_feature() {
        let setup = setup().await;
        trialing(&setup).await;
        let service = AccessService::new(setup.store.clone(), 3);

        let decision = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", Utc::now())
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.membership_type_id, Some(setup.membership_type_id));

        let other = service
            .verify_access(setup.tenant_id, setup.customer_id, "exports", Utc::now())
            .await
            .unwrap();
        assert!(!other.allowed);
        assert_eq!(other.reason, "feature_not_included");
    }

    #[tokio::test]
    async fn test_grace_only_while_past_due() {
        let setup = setup().await;
        let subscription_id = trialing(&setup).await;
        let service = AccessService::new(setup.store.clone(), 3);
        let expires = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", Utc::now())
            .await
            .unwrap()
            .expires_utc
            .unwrap();
        let within_grace = expires + chrono::Duration::days(1);

        // Active subscription: no grace after expiry
        let decision = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", within_grace)
            .await
            .unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "membership_expired");

        setup
            .store
            .set_billing_status(subscription_id, BillingStatus::PastDue)
            .await;
        let decision = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", within_grace)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.reason, "grace_period");

        let past_grace = expires + chrono::Duration::days(4);
        let decision = service
            .verify_access(setup.tenant_id, setup.customer_id, "reports", past_grace)
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_unknown_customer_not_found() {
        let setup = setup().await;
        let service = AccessService::new(setup.store.clone(), 3);
        let err = service
            .verify_access(setup.tenant_id, Uuid::new_v4(), "reports", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
