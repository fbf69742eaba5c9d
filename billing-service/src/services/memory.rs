//! In-process [`BillingStore`] for tests and local development.
//!
//! All state sits behind one async mutex, so every operation (including a
//! claim or an outcome commit) is serialised and therefore atomic.

use super::store::{
    clamp_page_size, held_lease_conflict, initial_schedule, monthly_amount, trial_membership,
    BillingStore, RunTotals, WebhookApplication,
};
use crate::models::{
    invoice_number, AnalyticsSnapshot, BillResultStatus, BillingRun, BillingRunResult,
    BillingRunStatus, BillingRunType, BillingStatus, CreateCustomer, CreateMembershipType,
    CreateOrder, CreatePaymentMethod, CreateSubscription, Invoice, InvoiceStatus,
    ListBillingRunsFilter, ListSubscriptionsFilter, MembershipStatus, MembershipType, MetricType,
    NewMembership, NewPayment, Order, OrderStatus, Payment, PaymentMethod, PaymentStatus,
    ProviderCustomer, Subscription, UserMembership, WebhookEventRecord,
};
use crate::providers::{Provider, ProviderEvent, ProviderEventKind};
use crate::services::ledger::{BillingOutcome, InvoiceUpdate, MembershipUpdate, OrderOutcome};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    customers: BTreeMap<Uuid, ProviderCustomer>,
    payment_methods: BTreeMap<Uuid, PaymentMethod>,
    membership_types: BTreeMap<Uuid, MembershipType>,
    subscriptions: BTreeMap<Uuid, Subscription>,
    invoices: BTreeMap<Uuid, Invoice>,
    payments: BTreeMap<Uuid, Payment>,
    orders: BTreeMap<Uuid, Order>,
    memberships: BTreeMap<Uuid, UserMembership>,
    runs: BTreeMap<Uuid, BillingRun>,
    run_results: Vec<BillingRunResult>,
    webhook_events: HashMap<(String, String), WebhookEventRecord>,
    snapshots: HashMap<(Uuid, NaiveDate, MetricType, String), AnalyticsSnapshot>,
    /// Operations whose next call fails.
    faults: HashSet<&'static str>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) async fn set_billing_status(&self, subscription_id: Uuid, status: BillingStatus) {
        let mut state = self.state.lock().await;
        if let Some(sub) = state.subscriptions.get_mut(&subscription_id) {
            sub.billing_status = status.as_str().to_string();
        }
    }

    #[cfg(test)]
    pub(crate) async fn fail_next(&self, operation: &'static str) {
        self.state.lock().await.faults.insert(operation);
    }
}

impl MemoryState {
    fn take_fault(&mut self, operation: &'static str) -> Result<(), AppError> {
        if self.faults.remove(operation) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "{} failed",
                operation
            )));
        }
        Ok(())
    }

    fn insert_payment(&mut self, input: &NewPayment) -> Result<Payment, AppError> {
        if self
            .payments
            .values()
            .any(|p| p.idempotency_key == input.idempotency_key)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment already recorded for {}",
                input.idempotency_key
            )));
        }
        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            invoice_id: input.invoice_id,
            customer_id: input.customer_id,
            provider: input.provider.clone(),
            provider_payment_ref: input.provider_payment_ref.clone(),
            amount: input.amount,
            currency: input.currency.clone(),
            status: input.status.as_str().to_string(),
            failure_code: input.failure_code.clone(),
            failure_message: input.failure_message.clone(),
            attempt_number: input.attempt_number,
            idempotency_key: input.idempotency_key.clone(),
            refunded_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        self.payments.insert(payment.payment_id, payment.clone());
        Ok(payment)
    }

    fn apply_invoice_update(&mut self, update: &InvoiceUpdate) -> Result<(), AppError> {
        let invoice = self
            .invoices
            .get_mut(&update.invoice_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", update.invoice_id)))?;
        invoice.status = update.status.as_str().to_string();
        invoice.attempt_count += 1;
        if update.paid_utc.is_some() {
            invoice.paid_utc = update.paid_utc;
        }
        invoice.updated_utc = Utc::now();
        Ok(())
    }

    fn insert_membership(&mut self, input: &NewMembership) -> UserMembership {
        let now = Utc::now();
        let membership = UserMembership {
            membership_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            membership_type_id: input.membership_type_id,
            subscription_id: input.subscription_id,
            order_id: input.order_id,
            status: MembershipStatus::Active.as_str().to_string(),
            starts_utc: input.starts_utc,
            expires_utc: input.expires_utc,
            created_utc: now,
            updated_utc: now,
        };
        self.memberships
            .insert(membership.membership_id, membership.clone());
        membership
    }

    fn subscription_membership(&mut self, subscription_id: Uuid) -> Option<&mut UserMembership> {
        self.memberships
            .values_mut()
            .find(|m| m.subscription_id == Some(subscription_id))
    }

    fn set_subscription_membership_status(&mut self, subscription_id: Uuid, status: MembershipStatus) {
        if let Some(membership) = self.subscription_membership(subscription_id) {
            membership.status = status.as_str().to_string();
            membership.updated_utc = Utc::now();
        }
    }
}

fn not_found(what: &str, id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("{} {} not found", what, id))
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn create_customer(&self, input: &CreateCustomer) -> Result<ProviderCustomer, AppError> {
        let mut state = self.state.lock().await;
        let provider = input.provider.as_str();
        if state.customers.values().any(|c| {
            c.tenant_id == input.tenant_id
                && c.provider == provider
                && c.provider_customer_ref == input.provider_customer_ref
        }) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Customer {} already exists for {}",
                input.provider_customer_ref, provider
            )));
        }

        let now = Utc::now();
        let customer = ProviderCustomer {
            customer_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            user_id: input.user_id,
            guest_email: input.guest_email.clone(),
            display_name: input.display_name.clone(),
            provider: provider.to_string(),
            provider_customer_ref: input.provider_customer_ref.clone(),
            created_utc: now,
            updated_utc: now,
        };
        state.customers.insert(customer.customer_id, customer.clone());
        Ok(customer)
    }

    async fn get_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<ProviderCustomer>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .get(&customer_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_customers(
        &self,
        tenant_id: Uuid,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<ProviderCustomer>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .filter(|c| page_token.map_or(true, |t| c.customer_id > t))
            .take(clamp_page_size(page_size) as usize)
            .cloned()
            .collect())
    }

    async fn create_payment_method(
        &self,
        input: &CreatePaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let mut state = self.state.lock().await;
        if !state
            .customers
            .get(&input.customer_id)
            .is_some_and(|c| c.tenant_id == input.tenant_id)
        {
            return Err(not_found("Customer", input.customer_id));
        }

        let existing: Vec<Uuid> = state
            .payment_methods
            .values()
            .filter(|m| m.customer_id == input.customer_id)
            .map(|m| m.payment_method_id)
            .collect();
        if state
            .payment_methods
            .values()
            .any(|m| m.customer_id == input.customer_id && m.provider_method_ref == input.provider_method_ref)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment method {} already stored",
                input.provider_method_ref
            )));
        }

        let is_default = input.is_default || existing.is_empty();
        if is_default {
            for id in existing {
                if let Some(m) = state.payment_methods.get_mut(&id) {
                    m.is_default = false;
                }
            }
        }

        let method = PaymentMethod {
            payment_method_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            provider: input.provider.as_str().to_string(),
            provider_method_ref: input.provider_method_ref.clone(),
            kind: input.kind.clone(),
            brand: input.brand.clone(),
            last4: input.last4.clone(),
            exp_month: input.exp_month,
            exp_year: input.exp_year,
            is_default,
            created_utc: Utc::now(),
        };
        state
            .payment_methods
            .insert(method.payment_method_id, method.clone());
        Ok(method)
    }

    async fn get_payment_method(
        &self,
        tenant_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .payment_methods
            .get(&payment_method_id)
            .filter(|m| m.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_payment_methods(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, AppError> {
        let state = self.state.lock().await;
        let mut methods: Vec<PaymentMethod> = state
            .payment_methods
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.customer_id == customer_id)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_utc);
        Ok(methods)
    }

    async fn default_payment_method(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .payment_methods
            .values()
            .find(|m| m.tenant_id == tenant_id && m.customer_id == customer_id && m.is_default)
            .cloned())
    }

    async fn create_membership_type(
        &self,
        input: &CreateMembershipType,
    ) -> Result<MembershipType, AppError> {
        let mut state = self.state.lock().await;
        if state
            .membership_types
            .values()
            .any(|t| t.tenant_id == input.tenant_id && t.name == input.name)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Membership type {} already exists",
                input.name
            )));
        }

        let now = Utc::now();
        let membership_type = MembershipType {
            membership_type_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            name: input.name.clone(),
            description: input.description.clone(),
            features: input.features.clone(),
            price: input.price,
            currency: input.currency.clone(),
            billing_interval: input.billing_interval.as_str().to_string(),
            interval_count: input.interval_count,
            is_recurring: input.is_recurring,
            duration_days: input.duration_days,
            is_active: true,
            created_utc: now,
            updated_utc: now,
        };
        state
            .membership_types
            .insert(membership_type.membership_type_id, membership_type.clone());
        Ok(membership_type)
    }

    async fn get_membership_type(
        &self,
        tenant_id: Uuid,
        membership_type_id: Uuid,
    ) -> Result<Option<MembershipType>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .membership_types
            .get(&membership_type_id)
            .filter(|t| t.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_membership_types(
        &self,
        tenant_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<MembershipType>, AppError> {
        let state = self.state.lock().await;
        let mut types: Vec<MembershipType> = state
            .membership_types
            .values()
            .filter(|t| t.tenant_id == tenant_id && (!active_only || t.is_active))
            .cloned()
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }

    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state.lock().await;
        let (period_start, period_end, next_billing_date) = initial_schedule(input);
        let now = Utc::now();
        let subscription = Subscription {
            subscription_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            membership_type_id: input.membership_type_id,
            payment_method_id: input.payment_method_id,
            billing_status: BillingStatus::Active.as_str().to_string(),
            amount: input.amount,
            currency: input.currency.clone(),
            billing_interval: input.billing_interval.as_str().to_string(),
            interval_count: input.interval_count,
            start_date: input.start_date,
            trial_end_date: input.trial_end_date,
            current_period_start: period_start,
            current_period_end: period_end,
            next_billing_date: Some(next_billing_date),
            billing_retry_count: 0,
            max_retry_attempts: input.max_retry_attempts,
            last_billing_attempt: None,
            cancel_at_period_end: false,
            cancelled_utc: None,
            lease_owner: None,
            lease_expires_utc: None,
            metadata: input.metadata.clone(),
            created_utc: now,
            updated_utc: now,
        };
        if let Some(trial) = trial_membership(input, subscription.subscription_id) {
            state.insert_membership(&trial);
        }
        state
            .subscriptions
            .insert(subscription.subscription_id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_subscriptions(
        &self,
        tenant_id: Uuid,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .filter(|s| filter.customer_id.map_or(true, |c| s.customer_id == c))
            .filter(|s| filter.status.map_or(true, |st| s.billing_status == st.as_str()))
            .filter(|s| filter.page_token.map_or(true, |t| s.subscription_id > t))
            .take(clamp_page_size(filter.page_size) as usize)
            .cloned()
            .collect())
    }

    async fn cancel_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
        else {
            return Ok(None);
        };

        let status = sub.try_status()?;
        if status == BillingStatus::Cancelled {
            return Err(AppError::Conflict(anyhow::anyhow!("Subscription is already cancelled")));
        }

        let immediate = !at_period_end || status == BillingStatus::Suspended;
        if immediate && !sub.lease_is_free(now) {
            return Err(held_lease_conflict());
        }
        if immediate {
            sub.billing_status = BillingStatus::Cancelled.as_str().to_string();
            sub.cancelled_utc = Some(now);
            sub.next_billing_date = None;
            sub.lease_owner = None;
            sub.lease_expires_utc = None;
        } else {
            sub.cancel_at_period_end = true;
        }
        sub.updated_utc = now;
        let sub = sub.clone();

        if immediate {
            state.set_subscription_membership_status(subscription_id, MembershipStatus::Cancelled);
        }
        Ok(Some(sub))
    }

    async fn reactivate_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
        else {
            return Ok(None);
        };

        match sub.try_status()? {
            BillingStatus::Cancelled => {
                return Err(AppError::Conflict(anyhow::anyhow!("Cancelled subscriptions cannot be reactivated")))
            }
            BillingStatus::Active if !sub.cancel_at_period_end => {
                return Err(AppError::Conflict(anyhow::anyhow!("Subscription is already active")))
            }
            BillingStatus::Active => sub.cancel_at_period_end = false,
            BillingStatus::PastDue | BillingStatus::Suspended => {
                sub.billing_status = BillingStatus::Active.as_str().to_string();
                sub.billing_retry_count = 0;
                sub.cancel_at_period_end = false;
                sub.next_billing_date = Some(now);
            }
        }
        sub.updated_utc = now;
        Ok(Some(sub.clone()))
    }

    async fn claim_due_subscriptions(
        &self,
        tenant_id: Option<Uuid>,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let mut state = self.state.lock().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = state
            .subscriptions
            .values()
            .filter(|s| tenant_id.map_or(true, |t| s.tenant_id == t))
            .filter(|s| s.is_due(now) && s.lease_is_free(now))
            .filter_map(|s| s.next_billing_date.map(|d| (d, s.subscription_id)))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, id) in due.into_iter().take(limit.max(0) as usize) {
            if let Some(sub) = state.subscriptions.get_mut(&id) {
                sub.lease_owner = Some(owner.to_string());
                sub.lease_expires_utc = Some(lease_until);
                sub.updated_utc = now;
                claimed.push(sub.clone());
            }
        }
        Ok(claimed)
    }

    async fn claim_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state.lock().await;
        let sub = state
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .ok_or_else(|| not_found("Subscription", subscription_id))?;

        if !(sub.is_due(now) || sub.status() == BillingStatus::PastDue) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription is not due for billing (status {})",
                sub.billing_status
            )));
        }
        if !sub.lease_is_free(now) {
            return Err(AppError::Conflict(anyhow::anyhow!("Subscription is being billed by another worker")));
        }

        sub.lease_owner = Some(owner.to_string());
        sub.lease_expires_utc = Some(lease_until);
        sub.updated_utc = now;
        Ok(sub.clone())
    }

    async fn open_invoice(
        &self,
        subscription: &Subscription,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.invoices.values().find(|i| {
            i.subscription_id == Some(subscription.subscription_id)
                && i.period_start == Some(period_start)
        }) {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let invoice = Invoice {
            invoice_id,
            tenant_id: subscription.tenant_id,
            customer_id: subscription.customer_id,
            subscription_id: Some(subscription.subscription_id),
            order_id: None,
            invoice_number: invoice_number(invoice_id, period_start),
            amount: subscription.amount,
            currency: subscription.currency.clone(),
            status: InvoiceStatus::Open.as_str().to_string(),
            period_start: Some(period_start),
            period_end: Some(period_end),
            attempt_count: 0,
            paid_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        state.invoices.insert(invoice_id, invoice.clone());
        Ok(invoice)
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .get(&invoice_id)
            .filter(|i| i.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let state = self.state.lock().await;
        let mut invoices: Vec<Invoice> = state
            .invoices
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.subscription_id == Some(subscription_id))
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.period_start);
        Ok(invoices)
    }

    async fn list_payments_for_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.invoice_id == invoice_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.attempt_number);
        Ok(payments)
    }

    async fn record_billing_outcome(
        &self,
        outcome: &BillingOutcome,
    ) -> Result<Subscription, AppError> {
        let mut state = self.state.lock().await;

        // Validate everything before the first write
        let holds_lease = state
            .subscriptions
            .get(&outcome.subscription_id)
            .ok_or_else(|| not_found("Subscription", outcome.subscription_id))?
            .lease_owner
            .as_deref()
            == Some(outcome.lease_owner.as_str());
        if !holds_lease {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Lease on subscription {} no longer held by {}",
                outcome.subscription_id, outcome.lease_owner
            )));
        }
        if let Some(update) = &outcome.invoice {
            if !state.invoices.contains_key(&update.invoice_id) {
                return Err(not_found("Invoice", update.invoice_id));
            }
        }
        if let Some(payment) = &outcome.payment {
            if state
                .payments
                .values()
                .any(|p| p.idempotency_key == payment.idempotency_key)
            {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Payment already recorded for {}",
                    payment.idempotency_key
                )));
            }
        }

        if let Some(update) = &outcome.invoice {
            state.apply_invoice_update(update)?;
        }
        if let Some(payment) = &outcome.payment {
            state.insert_payment(payment)?;
        }

        match &outcome.membership {
            MembershipUpdate::Renew(renewal) => {
                let subscription_id = outcome.subscription_id;
                if let Some(existing) = state.subscription_membership(subscription_id) {
                    existing.status = MembershipStatus::Active.as_str().to_string();
                    existing.membership_type_id = renewal.membership_type_id;
                    existing.expires_utc = renewal.expires_utc;
                    existing.updated_utc = Utc::now();
                } else {
                    state.insert_membership(renewal);
                }
            }
            MembershipUpdate::SetStatus(status) => {
                state.set_subscription_membership_status(outcome.subscription_id, *status);
            }
            MembershipUpdate::None => {}
        }

        let t = &outcome.transition;
        let sub = state
            .subscriptions
            .get_mut(&outcome.subscription_id)
            .ok_or_else(|| not_found("Subscription", outcome.subscription_id))?;
        sub.billing_status = t.status.as_str().to_string();
        sub.billing_retry_count = t.billing_retry_count;
        sub.current_period_start = t.current_period_start;
        sub.current_period_end = t.current_period_end;
        sub.next_billing_date = t.next_billing_date;
        sub.last_billing_attempt = t.last_billing_attempt;
        // A pending cancel requested during the charge survives its outcome.
        if t.status == BillingStatus::Cancelled {
            sub.cancel_at_period_end = t.cancel_at_period_end;
        }
        sub.cancelled_utc = t.cancelled_utc;
        sub.lease_owner = None;
        sub.lease_expires_utc = None;
        sub.updated_utc = Utc::now();
        Ok(sub.clone())
    }

    async fn create_order(&self, input: &CreateOrder) -> Result<(Order, Invoice), AppError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let invoice_id = Uuid::new_v4();

        let invoice = Invoice {
            invoice_id,
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            subscription_id: None,
            order_id: Some(order_id),
            invoice_number: invoice_number(invoice_id, now.date_naive()),
            amount: input.amount,
            currency: input.currency.clone(),
            status: InvoiceStatus::Open.as_str().to_string(),
            period_start: None,
            period_end: None,
            attempt_count: 0,
            paid_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        let order = Order {
            order_id,
            tenant_id: input.tenant_id,
            customer_id: input.customer_id,
            membership_type_id: input.membership_type_id,
            payment_method_id: input.payment_method_id,
            amount: input.amount,
            currency: input.currency.clone(),
            status: OrderStatus::Pending.as_str().to_string(),
            invoice_id: Some(invoice_id),
            created_utc: now,
            updated_utc: now,
        };
        state.invoices.insert(invoice_id, invoice.clone());
        state.orders.insert(order_id, order.clone());
        Ok((order, invoice))
    }

    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .orders
            .get(&order_id)
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn record_order_outcome(&self, outcome: &OrderOutcome) -> Result<Order, AppError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get(&outcome.order_id)
            .filter(|o| o.tenant_id == outcome.tenant_id)
            .ok_or_else(|| not_found("Order", outcome.order_id))?;
        if order.status != OrderStatus::Pending.as_str() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Order {} is already {}",
                outcome.order_id, order.status
            )));
        }
        if !state.invoices.contains_key(&outcome.invoice.invoice_id) {
            return Err(not_found("Invoice", outcome.invoice.invoice_id));
        }

        state.insert_payment(&outcome.payment)?;
        state.apply_invoice_update(&outcome.invoice)?;
        if let Some(membership) = &outcome.membership {
            state.insert_membership(membership);
        }

        let order = state
            .orders
            .get_mut(&outcome.order_id)
            .ok_or_else(|| not_found("Order", outcome.order_id))?;
        order.status = outcome.status.as_str().to_string();
        order.updated_utc = Utc::now();
        Ok(order.clone())
    }

    async fn list_memberships(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<UserMembership>, AppError> {
        let state = self.state.lock().await;
        let mut memberships: Vec<UserMembership> = state
            .memberships
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.customer_id == customer_id)
            .cloned()
            .collect();
        memberships.sort_by_key(|m| m.created_utc);
        Ok(memberships)
    }

    async fn create_billing_run(
        &self,
        tenant_id: Uuid,
        run_type: BillingRunType,
    ) -> Result<BillingRun, AppError> {
        let mut state = self.state.lock().await;
        let run = BillingRun {
            run_id: Uuid::new_v4(),
            tenant_id,
            run_type: run_type.as_str().to_string(),
            status: BillingRunStatus::Running.as_str().to_string(),
            started_utc: Utc::now(),
            completed_utc: None,
            subscriptions_processed: 0,
            subscriptions_succeeded: 0,
            subscriptions_failed: 0,
            error_message: None,
        };
        state.runs.insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn add_billing_run_result(
        &self,
        run_id: Uuid,
        subscription_id: Uuid,
        status: BillResultStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError> {
        let mut state = self.state.lock().await;
        state.take_fault("add_billing_run_result")?;
        if !state.runs.contains_key(&run_id) {
            return Err(not_found("Billing run", run_id));
        }
        let result = BillingRunResult {
            result_id: Uuid::new_v4(),
            run_id,
            subscription_id,
            status: status.as_str().to_string(),
            invoice_id,
            error_message,
            created_utc: Utc::now(),
        };
        state.run_results.push(result.clone());
        Ok(result)
    }

    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_message: Option<String>,
    ) -> Result<BillingRun, AppError> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("Billing run", run_id))?;
        run.status = totals.status().as_str().to_string();
        run.completed_utc = Some(Utc::now());
        run.subscriptions_processed = totals.processed;
        run.subscriptions_succeeded = totals.succeeded;
        run.subscriptions_failed = totals.failed + totals.errored;
        run.error_message = error_message;
        Ok(run.clone())
    }

    async fn get_billing_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BillingRun>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .get(&run_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_billing_run_results(&self, run_id: Uuid) -> Result<Vec<BillingRunResult>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .run_results
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_billing_runs(
        &self,
        tenant_id: Uuid,
        filter: &ListBillingRunsFilter,
    ) -> Result<Vec<BillingRun>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| filter.status.map_or(true, |s| r.status == s.as_str()))
            .filter(|r| filter.run_type.map_or(true, |t| r.run_type == t.as_str()))
            .filter(|r| filter.page_token.map_or(true, |t| r.run_id > t))
            .take(clamp_page_size(filter.page_size) as usize)
            .cloned()
            .collect())
    }

    async fn apply_webhook_event(
        &self,
        provider: Provider,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookApplication, AppError> {
        let mut state = self.state.lock().await;
        let key = (provider.as_str().to_string(), event.event_id.clone());
        if state.webhook_events.contains_key(&key) {
            return Ok(WebhookApplication::Duplicate);
        }
        state.webhook_events.insert(
            key,
            WebhookEventRecord {
                provider: provider.as_str().to_string(),
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                received_utc: now,
            },
        );

        let reference = match &event.kind {
            ProviderEventKind::PaymentSucceeded(r)
            | ProviderEventKind::PaymentFailed(r)
            | ProviderEventKind::PaymentRefunded(r) => r,
            ProviderEventKind::Ignored => return Ok(WebhookApplication::Applied),
        };

        let Some(payment) = state.payments.values_mut().find(|p| {
            p.provider == provider.as_str() && p.provider_payment_ref.as_deref() == Some(reference)
        }) else {
            return Ok(WebhookApplication::UnknownReference);
        };

        let current = PaymentStatus::from_string(&payment.status);
        let invoice_id = payment.invoice_id;
        let mut invoice_status = None;
        match &event.kind {
            ProviderEventKind::PaymentSucceeded(_) => {
                if matches!(current, PaymentStatus::Pending | PaymentStatus::Failed) {
                    payment.status = PaymentStatus::Succeeded.as_str().to_string();
                    payment.updated_utc = now;
                    invoice_status = Some(InvoiceStatus::Paid);
                }
            }
            ProviderEventKind::PaymentFailed(_) => {
                if current == PaymentStatus::Pending {
                    payment.status = PaymentStatus::Failed.as_str().to_string();
                    payment.updated_utc = now;
                }
            }
            ProviderEventKind::PaymentRefunded(_) => {
                if current != PaymentStatus::Refunded {
                    payment.status = PaymentStatus::Refunded.as_str().to_string();
                    payment.refunded_utc = Some(now);
                    payment.updated_utc = now;
                    invoice_status = Some(InvoiceStatus::Void);
                }
            }
            ProviderEventKind::Ignored => {}
        }

        let Some(status) = invoice_status else {
            return Ok(WebhookApplication::Applied);
        };
        let mut refunded_order = None;
        if let Some(invoice) = state.invoices.get_mut(&invoice_id) {
            if status == InvoiceStatus::Void || invoice.status == InvoiceStatus::Open.as_str() {
                invoice.status = status.as_str().to_string();
                if status == InvoiceStatus::Paid {
                    invoice.paid_utc = Some(now);
                }
                invoice.updated_utc = now;
            }
            if status == InvoiceStatus::Void {
                refunded_order = invoice.order_id;
            }
        }
        if let Some(order_id) = refunded_order {
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.status = OrderStatus::Refunded.as_str().to_string();
                order.updated_utc = now;
            }
            for membership in state
                .memberships
                .values_mut()
                .filter(|m| m.order_id == Some(order_id))
            {
                membership.status = MembershipStatus::Cancelled.as_str().to_string();
                membership.updated_utc = now;
            }
        }
        Ok(WebhookApplication::Applied)
    }

    async fn revenue_for_date(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        currency: &str,
    ) -> Result<(Decimal, i64), AppError> {
        let state = self.state.lock().await;
        let payments = || {
            state
                .payments
                .values()
                .filter(move |p| p.tenant_id == tenant_id && p.currency == currency)
        };

        let (gross, count) = payments()
            .filter(|p| p.created_utc.date_naive() == date)
            .filter(|p| {
                matches!(
                    PaymentStatus::from_string(&p.status),
                    PaymentStatus::Succeeded | PaymentStatus::Refunded
                )
            })
            .fold((Decimal::ZERO, 0i64), |(sum, n), p| (sum + p.amount, n + 1));
        let refunds: Decimal = payments()
            .filter(|p| p.refunded_utc.is_some_and(|r| r.date_naive() == date))
            .map(|p| p.amount)
            .sum();

        Ok((gross - refunds, count))
    }

    async fn mrr(&self, tenant_id: Uuid, currency: &str) -> Result<(Decimal, i64), AppError> {
        let state = self.state.lock().await;
        let (total, count) = state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.currency == currency)
            .filter(|s| s.status().is_billable())
            .filter_map(|s| match s.try_interval() {
                Ok(interval) => Some((s, interval)),
                Err(e) => {
                    tracing::error!(error = %e, "Skipping subscription in MRR");
                    None
                }
            })
            .fold((Decimal::ZERO, 0i64), |(sum, n), (s, interval)| {
                (sum + monthly_amount(s.amount, interval, s.interval_count), n + 1)
            });
        Ok((total.round_dp(2), count))
    }

    async fn get_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
    ) -> Result<Option<AnalyticsSnapshot>, AppError> {
        let state = self.state.lock().await;
        Ok(state
            .snapshots
            .get(&(tenant_id, date, metric, currency.to_string()))
            .cloned())
    }

    async fn upsert_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
        value: Decimal,
        sample_count: i64,
    ) -> Result<AnalyticsSnapshot, AppError> {
        let mut state = self.state.lock().await;
        let key = (tenant_id, date, metric, currency.to_string());
        let snapshot_id = state
            .snapshots
            .get(&key)
            .map(|s| s.snapshot_id)
            .unwrap_or_else(Uuid::new_v4);
        let snapshot = AnalyticsSnapshot {
            snapshot_id,
            tenant_id,
            snapshot_date: date,
            metric_type: metric.as_str().to_string(),
            currency: currency.to_string(),
            value,
            sample_count,
            computed_utc: Utc::now(),
        };
        state.snapshots.insert(key, snapshot.clone());
        Ok(snapshot)
    }
}
