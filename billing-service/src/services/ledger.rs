//! Ledger writes for billing attempts.
//!
//! A [`BillingOutcome`] bundles every row one renewal attempt touches. The
//! store applies it in a single transaction, conditional on the caller
//! still holding the subscription lease.

use crate::models::{
    start_of_day, BillingStatus, Invoice, InvoiceStatus, MembershipStatus, NewMembership,
    NewPayment, Order, OrderStatus, PaymentStatus, Subscription, SubscriptionTransition,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    pub invoice_id: Uuid,
    pub status: InvoiceStatus,
    pub paid_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum MembershipUpdate {
    /// Upsert the subscription's membership as active.
    Renew(NewMembership),
    /// Set the status of the subscription's membership, if one exists.
    SetStatus(MembershipStatus),
    None,
}

#[derive(Debug, Clone)]
pub struct BillingOutcome {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    pub lease_owner: String,
    pub transition: SubscriptionTransition,
    pub invoice: Option<InvoiceUpdate>,
    pub payment: Option<NewPayment>,
    pub membership: MembershipUpdate,
}

#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub invoice: InvoiceUpdate,
    pub payment: NewPayment,
    pub membership: Option<NewMembership>,
}

/// Everything known about one charge attempt before the provider answers.
#[derive(Debug, Clone)]
pub struct Attempt<'a> {
    pub subscription: &'a Subscription,
    pub invoice: &'a Invoice,
    pub lease_owner: &'a str,
    pub provider: &'a str,
    pub attempt_number: i32,
    pub idempotency_key: String,
}

impl<'a> Attempt<'a> {
    fn payment(
        &self,
        status: PaymentStatus,
        provider_payment_ref: Option<String>,
        failure: Option<(String, String)>,
    ) -> NewPayment {
        let (failure_code, failure_message) = match failure {
            Some((code, message)) => (Some(code), Some(message)),
            None => (None, None),
        };
        NewPayment {
            tenant_id: self.subscription.tenant_id,
            invoice_id: self.invoice.invoice_id,
            customer_id: self.subscription.customer_id,
            provider: self.provider.to_string(),
            provider_payment_ref,
            amount: self.invoice.amount,
            currency: self.invoice.currency.clone(),
            status,
            failure_code,
            failure_message,
            attempt_number: self.attempt_number,
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn approved(
        &self,
        provider_payment_ref: String,
        transition: SubscriptionTransition,
        now: DateTime<Utc>,
    ) -> BillingOutcome {
        let sub = self.subscription;
        let membership = MembershipUpdate::Renew(NewMembership {
            tenant_id: sub.tenant_id,
            customer_id: sub.customer_id,
            membership_type_id: sub.membership_type_id,
            subscription_id: Some(sub.subscription_id),
            order_id: None,
            starts_utc: now,
            expires_utc: Some(start_of_day(transition.current_period_end)),
        });

        BillingOutcome {
            tenant_id: sub.tenant_id,
            subscription_id: sub.subscription_id,
            lease_owner: self.lease_owner.to_string(),
            invoice: Some(InvoiceUpdate {
                invoice_id: self.invoice.invoice_id,
                status: InvoiceStatus::Paid,
                paid_utc: Some(now),
            }),
            payment: Some(self.payment(
                PaymentStatus::Succeeded,
                Some(provider_payment_ref),
                None,
            )),
            membership,
            transition,
        }
    }

    /// A declined attempt. `code` of `no_payment_method` is recorded without
    /// a payment row since nothing reached the provider.
    pub fn declined(
        &self,
        code: String,
        message: String,
        transition: SubscriptionTransition,
        record_payment: bool,
    ) -> BillingOutcome {
        let sub = self.subscription;
        let (invoice_status, membership) = match transition.status {
            BillingStatus::Suspended => (
                InvoiceStatus::Uncollectible,
                MembershipUpdate::SetStatus(MembershipStatus::Suspended),
            ),
            BillingStatus::Cancelled => (
                InvoiceStatus::Uncollectible,
                MembershipUpdate::SetStatus(MembershipStatus::Cancelled),
            ),
            _ => (InvoiceStatus::Open, MembershipUpdate::None),
        };

        BillingOutcome {
            tenant_id: sub.tenant_id,
            subscription_id: sub.subscription_id,
            lease_owner: self.lease_owner.to_string(),
            invoice: Some(InvoiceUpdate {
                invoice_id: self.invoice.invoice_id,
                status: invoice_status,
                paid_utc: None,
            }),
            payment: record_payment
                .then(|| self.payment(PaymentStatus::Failed, None, Some((code, message)))),
            membership,
            transition,
        }
    }
}

/// Outcome for a pending cancellation reaching its period end.
pub fn cancelled_at_period_end(
    sub: &Subscription,
    lease_owner: &str,
    transition: SubscriptionTransition,
) -> BillingOutcome {
    BillingOutcome {
        tenant_id: sub.tenant_id,
        subscription_id: sub.subscription_id,
        lease_owner: lease_owner.to_string(),
        transition,
        invoice: None,
        payment: None,
        membership: MembershipUpdate::SetStatus(MembershipStatus::Cancelled),
    }
}

/// Outcome for a one-time order charge.
pub fn order_outcome(
    order: &Order,
    invoice: &Invoice,
    provider: &str,
    duration_days: Option<i32>,
    result: Result<String, (String, String)>,
    now: DateTime<Utc>,
) -> OrderOutcome {
    let base = NewPayment {
        tenant_id: order.tenant_id,
        invoice_id: invoice.invoice_id,
        customer_id: order.customer_id,
        provider: provider.to_string(),
        provider_payment_ref: None,
        amount: order.amount,
        currency: order.currency.clone(),
        status: PaymentStatus::Failed,
        failure_code: None,
        failure_message: None,
        attempt_number: 1,
        idempotency_key: format!("order:{}", order.order_id),
    };

    match result {
        Ok(provider_payment_ref) => OrderOutcome {
            tenant_id: order.tenant_id,
            order_id: order.order_id,
            status: OrderStatus::Paid,
            invoice: InvoiceUpdate {
                invoice_id: invoice.invoice_id,
                status: InvoiceStatus::Paid,
                paid_utc: Some(now),
            },
            payment: NewPayment {
                status: PaymentStatus::Succeeded,
                provider_payment_ref: Some(provider_payment_ref),
                ..base
            },
            membership: Some(NewMembership {
                tenant_id: order.tenant_id,
                customer_id: order.customer_id,
                membership_type_id: order.membership_type_id,
                subscription_id: None,
                order_id: Some(order.order_id),
                starts_utc: now,
                expires_utc: duration_days.map(|d| now + chrono::Duration::days(d as i64)),
            }),
        },
        Err((code, message)) => OrderOutcome {
            tenant_id: order.tenant_id,
            order_id: order.order_id,
            status: OrderStatus::Failed,
            invoice: InvoiceUpdate {
                invoice_id: invoice.invoice_id,
                status: InvoiceStatus::Void,
                paid_utc: None,
            },
            payment: NewPayment {
                failure_code: Some(code),
                failure_message: Some(message),
                ..base
            },
            membership: None,
        },
    }
}

/// Idempotency key for a renewal attempt. Stable across resends of the same
/// attempt so the provider deduplicates them.
pub fn renewal_idempotency_key(sub: &Subscription, attempt_number: i32) -> String {
    let (period_start, _) = sub.next_period();
    format!(
        "{}:{}:{}",
        sub.subscription_id,
        period_start.format("%Y%m%d"),
        attempt_number
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::retry_policy::tests::subscription;
    use crate::services::retry_policy::RetryPolicy;
    use chrono::TimeZone;

    fn invoice_for(sub: &Subscription) -> Invoice {
        let (start, end) = sub.next_period();
        Invoice {
            invoice_id: Uuid::new_v4(),
            tenant_id: sub.tenant_id,
            customer_id: sub.customer_id,
            subscription_id: Some(sub.subscription_id),
            order_id: None,
            invoice_number: "INV-1".to_string(),
            amount: sub.amount,
            currency: sub.currency.clone(),
            status: "open".to_string(),
            period_start: Some(start),
            period_end: Some(end),
            attempt_count: 0,
            paid_utc: None,
            created_utc: sub.created_utc,
            updated_utc: sub.created_utc,
        }
    }

    #[test]
    fn test_idempotency_key_is_stable_per_attempt() {
        let sub = subscription(0, 3);
        let key = renewal_idempotency_key(&sub, 1);
        assert_eq!(key, format!("{}:20250301:1", sub.subscription_id));
        assert_eq!(key, renewal_idempotency_key(&sub, 1));
        assert_ne!(key, renewal_idempotency_key(&sub, 2));
    }

    #[test]
    fn test_approved_outcome_renews_membership() {
        let sub = subscription(0, 3);
        let invoice = invoice_for(&sub);
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 1, 0, 0).unwrap();
        let (_, end) = sub.next_period();
        let attempt = Attempt {
            subscription: &sub,
            invoice: &invoice,
            lease_owner: "w1",
            provider: "stripe",
            attempt_number: 1,
            idempotency_key: renewal_idempotency_key(&sub, 1),
        };
        let outcome = attempt.approved(
            "pi_1".to_string(),
            RetryPolicy::default().on_success(&sub, end, now),
            now,
        );

        let payment = outcome.payment.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.provider_payment_ref.as_deref(), Some("pi_1"));
        assert_eq!(outcome.invoice.unwrap().status, InvoiceStatus::Paid);
        match outcome.membership {
            MembershipUpdate::Renew(m) => {
                assert_eq!(m.expires_utc, Some(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap()))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_terminal_decline_suspends_membership() {
        let sub = subscription(2, 3);
        let invoice = invoice_for(&sub);
        let now = Utc::now();
        let attempt = Attempt {
            subscription: &sub,
            invoice: &invoice,
            lease_owner: "w1",
            provider: "stripe",
            attempt_number: 3,
            idempotency_key: renewal_idempotency_key(&sub, 3),
        };
        let transition = RetryPolicy::default().on_failure(&sub, true, now);
        let outcome = attempt.declined(
            "card_declined".to_string(),
            "Declined".to_string(),
            transition,
            true,
        );

        assert_eq!(outcome.invoice.unwrap().status, InvoiceStatus::Uncollectible);
        assert!(matches!(
            outcome.membership,
            MembershipUpdate::SetStatus(MembershipStatus::Suspended)
        ));
        assert_eq!(outcome.payment.unwrap().failure_code.as_deref(), Some("card_declined"));
    }
}
