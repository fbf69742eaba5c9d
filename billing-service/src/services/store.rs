//! Storage abstraction for billing-service.
//!
//! [`BillingStore`] is implemented by [`PgStore`](super::database::PgStore)
//! for production and [`MemoryStore`](super::memory::MemoryStore) for tests
//! and local development. Both must uphold the same guarantees: claims are
//! atomic, outcomes commit only while the lease is held, and payment
//! idempotency keys are unique.

use crate::models::{
    start_of_day, AnalyticsSnapshot, BillResultStatus, BillingInterval, BillingRun,
    BillingRunResult, BillingRunStatus, BillingRunType, CreateCustomer, CreateMembershipType,
    CreateOrder, CreatePaymentMethod, CreateSubscription, Invoice, ListBillingRunsFilter,
    ListSubscriptionsFilter, MembershipType, MetricType, NewMembership, Order, Payment,
    PaymentMethod, ProviderCustomer, Subscription, UserMembership,
};
use crate::providers::{Provider, ProviderEvent};
use crate::services::ledger::{BillingOutcome, OrderOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

/// Result of applying a provider webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookApplication {
    /// `(provider, event_id)` was already recorded. Nothing changed.
    Duplicate,
    Applied,
    /// Recorded, but no payment matches the provider reference.
    UnknownReference,
}

impl WebhookApplication {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookApplication::Duplicate => "duplicate",
            WebhookApplication::Applied => "applied",
            WebhookApplication::UnknownReference => "unknown_reference",
        }
    }
}

/// Counters written when a billing run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTotals {
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub errored: i32,
}

impl RunTotals {
    pub fn add(&mut self, status: BillResultStatus) {
        self.processed += 1;
        match status {
            BillResultStatus::Succeeded | BillResultStatus::Cancelled => self.succeeded += 1,
            BillResultStatus::Failed => self.failed += 1,
            BillResultStatus::Deferred | BillResultStatus::Error => self.errored += 1,
        }
    }

    /// A run fails only when every processed subscription errored.
    pub fn status(&self) -> BillingRunStatus {
        if self.processed > 0 && self.errored == self.processed {
            BillingRunStatus::Failed
        } else {
            BillingRunStatus::Completed
        }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Customers

    async fn create_customer(&self, input: &CreateCustomer) -> Result<ProviderCustomer, AppError>;
    async fn get_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<ProviderCustomer>, AppError>;
    async fn list_customers(
        &self,
        tenant_id: Uuid,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<ProviderCustomer>, AppError>;

    // Payment methods

    /// The first method of a customer becomes the default. A new default
    /// replaces the previous one.
    async fn create_payment_method(
        &self,
        input: &CreatePaymentMethod,
    ) -> Result<PaymentMethod, AppError>;
    async fn get_payment_method(
        &self,
        tenant_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError>;
    async fn list_payment_methods(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, AppError>;
    async fn default_payment_method(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError>;

    // Membership types

    async fn create_membership_type(
        &self,
        input: &CreateMembershipType,
    ) -> Result<MembershipType, AppError>;
    async fn get_membership_type(
        &self,
        tenant_id: Uuid,
        membership_type_id: Uuid,
    ) -> Result<Option<MembershipType>, AppError>;
    async fn list_membership_types(
        &self,
        tenant_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<MembershipType>, AppError>;

    // Subscriptions

    /// Creates the subscription and, when it starts with a trial, an active
    /// membership until the trial ends.
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError>;
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError>;
    async fn list_subscriptions(
        &self,
        tenant_id: Uuid,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError>;
    /// Immediate cancellation also cancels the membership.
    async fn cancel_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError>;
    async fn reactivate_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError>;

    /// Atomically lease up to `limit` due subscriptions to `owner`.
    async fn claim_due_subscriptions(
        &self,
        tenant_id: Option<Uuid>,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError>;
    /// Lease one subscription for immediate billing. It must be due or
    /// past_due and not leased by another worker.
    async fn claim_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Subscription, AppError>;

    // Invoices and payments

    /// Get or create the invoice for a subscription period.
    async fn open_invoice(
        &self,
        subscription: &Subscription,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Invoice, AppError>;
    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError>;
    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError>;
    async fn list_payments_for_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError>;

    /// Apply a billing outcome in one transaction. Fails with `Conflict`
    /// and changes nothing if `outcome.lease_owner` no longer holds the lease.
    async fn record_billing_outcome(
        &self,
        outcome: &BillingOutcome,
    ) -> Result<Subscription, AppError>;

    // Orders

    /// Creates a pending order with its open invoice.
    async fn create_order(&self, input: &CreateOrder) -> Result<(Order, Invoice), AppError>;
    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError>;
    async fn record_order_outcome(&self, outcome: &OrderOutcome) -> Result<Order, AppError>;

    // Memberships

    async fn list_memberships(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<UserMembership>, AppError>;

    // Billing runs

    async fn create_billing_run(
        &self,
        tenant_id: Uuid,
        run_type: BillingRunType,
    ) -> Result<BillingRun, AppError>;
    async fn add_billing_run_result(
        &self,
        run_id: Uuid,
        subscription_id: Uuid,
        status: BillResultStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError>;
    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_message: Option<String>,
    ) -> Result<BillingRun, AppError>;
    async fn get_billing_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BillingRun>, AppError>;
    async fn get_billing_run_results(&self, run_id: Uuid) -> Result<Vec<BillingRunResult>, AppError>;
    async fn list_billing_runs(
        &self,
        tenant_id: Uuid,
        filter: &ListBillingRunsFilter,
    ) -> Result<Vec<BillingRun>, AppError>;

    // Webhooks

    async fn apply_webhook_event(
        &self,
        provider: Provider,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookApplication, AppError>;

    // Analytics

    /// Net revenue on `date`: succeeded (or later refunded) payments created
    /// that day minus refunds issued that day. Returns the value and the
    /// number of payments counted.
    async fn revenue_for_date(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        currency: &str,
    ) -> Result<(Decimal, i64), AppError>;
    /// Monthly recurring revenue of active and past_due subscriptions.
    async fn mrr(&self, tenant_id: Uuid, currency: &str) -> Result<(Decimal, i64), AppError>;
    async fn get_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
    ) -> Result<Option<AnalyticsSnapshot>, AppError>;
    async fn upsert_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
        value: Decimal,
        sample_count: i64,
    ) -> Result<AnalyticsSnapshot, AppError>;
}

/// Initial schedule of a new subscription: `(period_start, period_end,
/// next_billing_date)`. A trial is paid-through until it ends; otherwise the
/// first charge is due on the start date.
pub fn initial_schedule(input: &CreateSubscription) -> (NaiveDate, NaiveDate, DateTime<Utc>) {
    let paid_through = input
        .trial_end_date
        .filter(|d| *d > input.start_date)
        .unwrap_or(input.start_date);
    (input.start_date, paid_through, start_of_day(paid_through))
}

/// Membership granted for the trial period, if any.
pub fn trial_membership(input: &CreateSubscription, subscription_id: Uuid) -> Option<NewMembership> {
    let (start, paid_through, _) = initial_schedule(input);
    (paid_through > start).then(|| NewMembership {
        tenant_id: input.tenant_id,
        customer_id: input.customer_id,
        membership_type_id: input.membership_type_id,
        subscription_id: Some(subscription_id),
        order_id: None,
        starts_utc: start_of_day(start),
        expires_utc: Some(start_of_day(paid_through)),
    })
}

/// An immediate cancel must not take over a lease held by a charge in
/// flight, or a captured payment would have nowhere to be recorded.
pub fn held_lease_conflict() -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Subscription is being billed; retry the cancellation once the charge completes"
    ))
}

/// Monthly-normalised amount of one subscription.
pub fn monthly_amount(amount: Decimal, interval: BillingInterval, interval_count: i32) -> Decimal {
    amount * interval.monthly_factor() / Decimal::from(interval_count.max(1))
}

pub(crate) fn clamp_page_size(page_size: i32) -> i64 {
    if page_size <= 0 {
        50
    } else {
        page_size.clamp(1, 100) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(start: NaiveDate, trial_end: Option<NaiveDate>) -> CreateSubscription {
        CreateSubscription {
            tenant_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            membership_type_id: Uuid::new_v4(),
            payment_method_id: None,
            amount: Decimal::from(10),
            currency: "USD".to_string(),
            billing_interval: BillingInterval::Monthly,
            interval_count: 1,
            start_date: start,
            trial_end_date: trial_end,
            max_retry_attempts: 3,
            metadata: None,
        }
    }

    #[test]
    fn test_initial_schedule_without_trial_is_due_on_start() {
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let (ps, pe, next) = initial_schedule(&input(start, None));
        assert_eq!(ps, start);
        assert_eq!(pe, start);
        assert_eq!(next, start_of_day(start));
        assert!(trial_membership(&input(start, None), Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_trial_is_paid_through() {
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let trial_end = NaiveDate::from_ymd_opt(2025, 5, 15).unwrap();
        let (_, pe, next) = initial_schedule(&input(start, Some(trial_end)));
        assert_eq!(pe, trial_end);
        assert_eq!(next, start_of_day(trial_end));

        let membership = trial_membership(&input(start, Some(trial_end)), Uuid::new_v4()).unwrap();
        assert_eq!(membership.expires_utc, Some(start_of_day(trial_end)));
    }

    #[test]
    fn test_run_totals_status() {
        let mut totals = RunTotals::default();
        assert_eq!(totals.status(), BillingRunStatus::Completed);
        totals.add(BillResultStatus::Error);
        assert_eq!(totals.status(), BillingRunStatus::Failed);
        totals.add(BillResultStatus::Failed);
        assert_eq!(totals.status(), BillingRunStatus::Completed);
        assert_eq!(totals.processed, 2);
    }

    #[test]
    fn test_monthly_amount() {
        assert_eq!(
            monthly_amount(Decimal::from(60), BillingInterval::Monthly, 2),
            Decimal::from(30)
        );
    }
}
