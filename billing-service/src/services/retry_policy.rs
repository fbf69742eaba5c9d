//! Dunning state machine.
//!
//! Maps the result of a renewal attempt onto the subscription's next state:
//! success resets the retry counter and advances the paid-through date,
//! declines move the subscription to `past_due` on an exponential schedule
//! until `max_retry_attempts` is reached, at which point it is suspended or
//! cancelled.

use crate::config::BillingPolicyConfig;
use crate::models::{start_of_day, BillingStatus, Subscription, SubscriptionTransition};
use chrono::{DateTime, NaiveDate, Utc};
use service_core::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Default attempt budget for new subscriptions.
    pub max_retry_attempts: i32,
    pub backoff: RetryConfig,
    pub exhaustion_status: BillingStatus,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BillingPolicyConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BillingPolicyConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            backoff: RetryConfig {
                max_retries: config.max_retry_attempts.max(0) as u32,
                initial_backoff: config.retry_initial,
                max_backoff: config.retry_max,
                backoff_multiplier: 2.0,
                add_jitter: false,
            },
            exhaustion_status: config.exhaustion_status,
        }
    }

    /// Charge approved for the period ending at `period_end`.
    pub fn on_success(
        &self,
        sub: &Subscription,
        period_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> SubscriptionTransition {
        SubscriptionTransition {
            status: BillingStatus::Active,
            billing_retry_count: 0,
            current_period_start: sub.current_period_end,
            current_period_end: period_end,
            next_billing_date: Some(start_of_day(period_end)),
            last_billing_attempt: Some(now),
            cancel_at_period_end: sub.cancel_at_period_end,
            cancelled_utc: None,
        }
    }

    /// Charge declined. `retryable` is false for hard declines (stolen card,
    /// closed account) which skip the remaining attempts.
    pub fn on_failure(
        &self,
        sub: &Subscription,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> SubscriptionTransition {
        let max = sub.max_retry_attempts.max(1);
        let count = (sub.billing_retry_count + 1).min(max);
        let exhausted = count >= max || !retryable;

        let (status, next_billing_date, cancelled_utc) = if exhausted {
            let cancelled = (self.exhaustion_status == BillingStatus::Cancelled).then_some(now);
            (self.exhaustion_status, None, cancelled)
        } else {
            let delay = self.backoff.backoff_duration((count - 1) as u32);
            let next = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now);
            (BillingStatus::PastDue, Some(next), None)
        };

        SubscriptionTransition {
            status,
            billing_retry_count: count,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            next_billing_date,
            last_billing_attempt: Some(now),
            cancel_at_period_end: sub.cancel_at_period_end,
            cancelled_utc,
        }
    }

    /// Subscription reached the end of its paid period with a pending cancel.
    pub fn on_cancel_at_period_end(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> SubscriptionTransition {
        SubscriptionTransition {
            status: BillingStatus::Cancelled,
            billing_retry_count: sub.billing_retry_count,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            next_billing_date: None,
            last_billing_attempt: sub.last_billing_attempt,
            cancel_at_period_end: true,
            cancelled_utc: Some(now),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    pub(crate) fn subscription(retry_count: i32, max: i32) -> Subscription {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        Subscription {
            subscription_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            membership_type_id: Uuid::new_v4(),
            payment_method_id: None,
            billing_status: if retry_count > 0 { "past_due" } else { "active" }.to_string(),
            amount: Decimal::from(20),
            currency: "USD".to_string(),
            billing_interval: "monthly".to_string(),
            interval_count: 1,
            start_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            trial_end_date: None,
            current_period_start: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            current_period_end: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            next_billing_date: Some(now),
            billing_retry_count: retry_count,
            max_retry_attempts: max,
            last_billing_attempt: None,
            cancel_at_period_end: false,
            cancelled_utc: None,
            lease_owner: None,
            lease_expires_utc: None,
            metadata: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_success_resets_and_advances() {
        let policy = RetryPolicy::default();
        let sub = subscription(2, 3);
        let (_, end) = sub.next_period();
        let t = policy.on_success(&sub, end, now());

        assert_eq!(t.status, BillingStatus::Active);
        assert_eq!(t.billing_retry_count, 0);
        assert_eq!(t.current_period_start, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
        assert_eq!(t.current_period_end, NaiveDate::from_ymd_opt(2025, 4, 1).unwrap());
        assert_eq!(
            t.next_billing_date,
            Some(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_failure_backoff_doubles() {
        let policy = RetryPolicy::default();

        let first = policy.on_failure(&subscription(0, 5), true, now());
        assert_eq!(first.status, BillingStatus::PastDue);
        assert_eq!(first.billing_retry_count, 1);
        assert_eq!(first.next_billing_date, Some(now() + chrono::Duration::hours(24)));

        let second = policy.on_failure(&subscription(1, 5), true, now());
        assert_eq!(second.next_billing_date, Some(now() + chrono::Duration::hours(48)));

        // 24h * 2^3 = 192h, capped at 7 days
        let fourth = policy.on_failure(&subscription(3, 5), true, now());
        assert_eq!(fourth.next_billing_date, Some(now() + chrono::Duration::days(7)));
    }

    #[test]
    fn test_exhaustion_suspends() {
        let policy = RetryPolicy::default();
        let t = policy.on_failure(&subscription(2, 3), true, now());
        assert_eq!(t.status, BillingStatus::Suspended);
        assert_eq!(t.billing_retry_count, 3);
        assert_eq!(t.next_billing_date, None);
        assert_eq!(t.cancelled_utc, None);
    }

    #[test]
    fn test_exhaustion_cancels_when_configured() {
        let policy = RetryPolicy::from_config(&BillingPolicyConfig {
            exhaustion_status: BillingStatus::Cancelled,
            ..BillingPolicyConfig::default()
        });
        let t = policy.on_failure(&subscription(2, 3), true, now());
        assert_eq!(t.status, BillingStatus::Cancelled);
        assert_eq!(t.cancelled_utc, Some(now()));
    }

    #[test]
    fn test_hard_decline_is_terminal_immediately() {
        let policy = RetryPolicy::default();
        let t = policy.on_failure(&subscription(0, 3), false, now());
        assert_eq!(t.status, BillingStatus::Suspended);
        assert_eq!(t.billing_retry_count, 1);
    }

    #[test]
    fn test_retry_count_never_exceeds_max() {
        let policy = RetryPolicy::default();
        for max in 1..6 {
            let mut sub = subscription(0, max);
            for _ in 0..10 {
                let t = policy.on_failure(&sub, true, now());
                assert!(t.billing_retry_count <= max);
                if t.billing_retry_count == max {
                    assert!(t.status.is_terminal());
                }
                sub.billing_retry_count = t.billing_retry_count;
            }
        }
    }

    #[test]
    fn test_cancel_at_period_end() {
        let policy = RetryPolicy::default();
        let mut sub = subscription(0, 3);
        sub.cancel_at_period_end = true;
        let t = policy.on_cancel_at_period_end(&sub, now());
        assert_eq!(t.status, BillingStatus::Cancelled);
        assert_eq!(t.next_billing_date, None);
        assert_eq!(t.current_period_end, sub.current_period_end);
    }
}
