//! Billing engine: claims due subscriptions, charges them through the
//! provider registry and commits the outcome through the ledger.

use crate::config::{BillingConfig, SchedulerConfig};
use crate::models::{
    BillResultStatus, BillingRun, BillingRunType, Order, PaymentMethod, Provider, Subscription,
};
use crate::providers::{ChargeOutcome, ChargeRequest, ProviderError, ProviderRegistry};
use crate::services::ledger::{self, Attempt};
use crate::services::metrics::{
    record_billing_attempt, record_billing_run, record_error, record_payment_amount,
    record_provider_duration, record_subscription_transition,
};
use crate::services::retry_policy::RetryPolicy;
use crate::services::store::{BillingStore, RunTotals};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use service_core::error::AppError;
use service_core::retry::{retry_call, RetryConfig, Retryable};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Result of billing one claimed subscription.
#[derive(Debug, Clone)]
pub struct BillResult {
    pub subscription_id: Uuid,
    pub status: BillResultStatus,
    pub invoice_id: Option<Uuid>,
    pub message: Option<String>,
    /// State after the committed outcome. `None` when nothing was recorded.
    pub subscription: Option<Subscription>,
}

impl BillResult {
    fn unrecorded(
        subscription_id: Uuid,
        status: BillResultStatus,
        invoice_id: Option<Uuid>,
        message: String,
    ) -> Self {
        Self {
            subscription_id,
            status,
            invoice_id,
            message: Some(message),
            subscription: None,
        }
    }
}

pub struct BillingEngine {
    store: Arc<dyn BillingStore>,
    providers: Arc<ProviderRegistry>,
    policy: RetryPolicy,
    scheduler: SchedulerConfig,
    call_retry: RetryConfig,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        providers: Arc<ProviderRegistry>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            providers,
            policy: RetryPolicy::from_config(&config.billing),
            scheduler: config.scheduler.clone(),
            call_retry: RetryConfig {
                max_retries: config.billing.provider_call_retries,
                ..RetryConfig::quick()
            },
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.scheduler.worker_id
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.scheduler.lease_duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now)
    }

    /// Bill everything currently due, optionally for one tenant.
    ///
    /// Writes one billing run per tenant that had subscriptions processed.
    /// Manual runs for a named tenant always produce a run, even when empty.
    #[instrument(skip(self), fields(worker_id = %self.scheduler.worker_id, run_type = %run_type.as_str()))]
    pub async fn run_pass(
        &self,
        tenant_id: Option<Uuid>,
        run_type: BillingRunType,
    ) -> Result<Vec<BillingRun>, AppError> {
        let mut runs: HashMap<Uuid, (Uuid, RunTotals)> = HashMap::new();
        if let Some(tenant) = tenant_id.filter(|_| run_type != BillingRunType::Scheduled) {
            let run = self.store.create_billing_run(tenant, run_type).await?;
            runs.insert(tenant, (run.run_id, RunTotals::default()));
        }

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut pass_error: Option<AppError> = None;

        loop {
            let now = Utc::now();
            let claimed = match self
                .store
                .claim_due_subscriptions(
                    tenant_id,
                    self.worker_id(),
                    now,
                    self.lease_until(now),
                    self.scheduler.batch_size.max(1),
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "Failed to claim due subscriptions");
                    record_error("claim_failed", "run_pass");
                    pass_error = Some(e);
                    break;
                }
            };

            // A subscription deferred earlier in this pass can be reclaimed
            // once a short lease runs out; leave it for the next pass.
            let fresh: Vec<Subscription> = claimed
                .into_iter()
                .filter(|sub| seen.insert(sub.subscription_id))
                .collect();
            if fresh.is_empty() {
                break;
            }

            let results: Vec<(Uuid, BillResult)> = stream::iter(fresh)
                .map(|sub| async move {
                    let result = self.bill_or_report(&sub, now).await;
                    (sub.tenant_id, result)
                })
                .buffer_unordered(self.scheduler.concurrency.max(1))
                .collect()
                .await;

            // Outcomes are already committed; keep recording the rest of the
            // batch even if one write fails
            for (tenant, result) in results {
                if let Err(e) = self.record_run_result(&mut runs, tenant, run_type, result).await {
                    error!(error = %e, tenant_id = %tenant, "Failed to record billing run result");
                    record_error("run_record_failed", "run_pass");
                    pass_error.get_or_insert(e);
                }
            }
            if pass_error.is_some() {
                break;
            }
        }

        let error_message = pass_error.as_ref().map(|e| e.to_string());
        let mut finished = Vec::with_capacity(runs.len());
        for (_, (run_id, totals)) in runs {
            let run = match self
                .store
                .finish_billing_run(run_id, totals, error_message.clone())
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Failed to finish billing run");
                    record_error("run_finish_failed", "run_pass");
                    pass_error.get_or_insert(e);
                    continue;
                }
            };
            record_billing_run(run_type.as_str(), &run.status);
            info!(
                run_id = %run.run_id,
                tenant_id = %run.tenant_id,
                processed = totals.processed,
                succeeded = totals.succeeded,
                failed = totals.failed,
                errored = totals.errored,
                "Billing run finished"
            );
            finished.push(run);
        }

        match pass_error {
            Some(e) if finished.is_empty() => Err(e),
            _ => Ok(finished),
        }
    }

    async fn record_run_result(
        &self,
        runs: &mut HashMap<Uuid, (Uuid, RunTotals)>,
        tenant_id: Uuid,
        run_type: BillingRunType,
        result: BillResult,
    ) -> Result<(), AppError> {
        let (run_id, totals) = match runs.entry(tenant_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let run = self.store.create_billing_run(tenant_id, run_type).await?;
                entry.insert((run.run_id, RunTotals::default()))
            }
        };
        totals.add(result.status);
        self.store
            .add_billing_run_result(
                *run_id,
                result.subscription_id,
                result.status,
                result.invoice_id,
                result.message,
            )
            .await?;
        Ok(())
    }

    async fn bill_or_report(&self, sub: &Subscription, now: DateTime<Utc>) -> BillResult {
        match self.bill_claimed(sub, now).await {
            Ok(result) => result,
            Err(e) => {
                error!(subscription_id = %sub.subscription_id, error = %e, "Billing attempt failed");
                record_error("bill_failed", "bill_claimed");
                BillResult::unrecorded(
                    sub.subscription_id,
                    BillResultStatus::Error,
                    None,
                    e.to_string(),
                )
            }
        }
    }

    /// Bill one subscription whose lease this engine holds.
    #[instrument(skip(self, sub), fields(subscription_id = %sub.subscription_id, tenant_id = %sub.tenant_id))]
    pub async fn bill_claimed(
        &self,
        sub: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<BillResult, AppError> {
        let owner = self.worker_id();
        // A row with an unreadable status or interval is reported, never billed.
        sub.try_status()?;
        sub.try_interval()?;

        if sub.cancel_at_period_end {
            let transition = self.policy.on_cancel_at_period_end(sub, now);
            let outcome = ledger::cancelled_at_period_end(sub, owner, transition);
            let updated = self.store.record_billing_outcome(&outcome).await?;
            record_subscription_transition(&sub.billing_status, &updated.billing_status);
            info!("Subscription cancelled at period end");
            return Ok(BillResult {
                subscription_id: sub.subscription_id,
                status: BillResultStatus::Cancelled,
                invoice_id: None,
                message: None,
                subscription: Some(updated),
            });
        }

        let (period_start, period_end) = sub.next_period();
        let invoice = self.store.open_invoice(sub, period_start, period_end).await?;
        // Counted per invoice so a reactivated subscription never reuses a key
        let attempt_number = invoice.attempt_count + 1;
        let idempotency_key = ledger::renewal_idempotency_key(sub, attempt_number);

        let Some(method) = self.resolve_payment_method(sub).await? else {
            let attempt = Attempt {
                subscription: sub,
                invoice: &invoice,
                lease_owner: owner,
                provider: "none",
                attempt_number,
                idempotency_key,
            };
            let transition = self.policy.on_failure(sub, true, now);
            let outcome = attempt.declined(
                "no_payment_method".to_string(),
                "No payment method on file".to_string(),
                transition,
                false,
            );
            let updated = self.store.record_billing_outcome(&outcome).await?;
            record_billing_attempt("none", "no_payment_method");
            record_subscription_transition(&sub.billing_status, &updated.billing_status);
            warn!("No payment method on file");
            return Ok(BillResult {
                subscription_id: sub.subscription_id,
                status: BillResultStatus::Failed,
                invoice_id: Some(invoice.invoice_id),
                message: Some("no_payment_method".to_string()),
                subscription: Some(updated),
            });
        };

        let provider: Provider = method.provider.parse()?;
        let customer = self
            .store
            .get_customer(sub.tenant_id, sub.customer_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Customer {} not found", sub.customer_id))
            })?;

        let request = ChargeRequest {
            idempotency_key: idempotency_key.clone(),
            amount: invoice.amount,
            currency: invoice.currency.clone(),
            customer_ref: customer.provider_customer_ref.clone(),
            payment_method_ref: method.provider_method_ref.clone(),
            description: format!("Subscription renewal {}", invoice.invoice_number),
            invoice_id: invoice.invoice_id,
        };

        let charged = self.charge(provider, &request).await;
        let attempt = Attempt {
            subscription: sub,
            invoice: &invoice,
            lease_owner: owner,
            provider: provider.as_str(),
            attempt_number,
            idempotency_key,
        };

        let (status, outcome) = match charged {
            Ok(ChargeOutcome::Approved {
                provider_payment_ref,
            }) => {
                let transition = self.policy.on_success(sub, period_end, now);
                (
                    BillResultStatus::Succeeded,
                    attempt.approved(provider_payment_ref, transition, now),
                )
            }
            Ok(ChargeOutcome::Declined {
                code,
                message,
                retryable,
            }) => {
                let transition = self.policy.on_failure(sub, retryable, now);
                (
                    BillResultStatus::Failed,
                    attempt.declined(code, message, transition, true),
                )
            }
            Err(e) => {
                // Outcome unknown: keep the lease and retry the same attempt later
                let status = if e.is_retryable() {
                    BillResultStatus::Deferred
                } else {
                    BillResultStatus::Error
                };
                warn!(error = %e, status = %status.as_str(), "Charge outcome unknown, nothing recorded");
                record_billing_attempt(provider.as_str(), status.as_str());
                return Ok(BillResult::unrecorded(
                    sub.subscription_id,
                    status,
                    Some(invoice.invoice_id),
                    e.to_string(),
                ));
            }
        };

        let message = outcome
            .payment
            .as_ref()
            .and_then(|p| p.failure_code.clone());
        let updated = self.store.record_billing_outcome(&outcome).await?;

        match status {
            BillResultStatus::Succeeded => {
                record_billing_attempt(provider.as_str(), "approved");
                record_payment_amount(
                    &invoice.currency,
                    "renewal",
                    invoice.amount.to_f64().unwrap_or(0.0),
                );
            }
            _ => record_billing_attempt(provider.as_str(), "declined"),
        }
        record_subscription_transition(&sub.billing_status, &updated.billing_status);
        info!(
            status = %status.as_str(),
            attempt = attempt_number,
            billing_status = %updated.billing_status,
            "Billing attempt recorded"
        );

        Ok(BillResult {
            subscription_id: sub.subscription_id,
            status,
            invoice_id: Some(invoice.invoice_id),
            message,
            subscription: Some(updated),
        })
    }

    /// Claim and bill a single subscription now. It must be due or past due.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn bill_subscription_now(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(BillingRun, BillResult), AppError> {
        let now = Utc::now();
        let sub = self
            .store
            .claim_subscription(
                tenant_id,
                subscription_id,
                self.worker_id(),
                now,
                self.lease_until(now),
            )
            .await?;

        let run = self
            .store
            .create_billing_run(tenant_id, BillingRunType::Single)
            .await?;
        let result = self.bill_or_report(&sub, now).await;

        let mut totals = RunTotals::default();
        totals.add(result.status);
        self.store
            .add_billing_run_result(
                run.run_id,
                result.subscription_id,
                result.status,
                result.invoice_id,
                result.message.clone(),
            )
            .await?;
        let run = self.store.finish_billing_run(run.run_id, totals, None).await?;
        record_billing_run(BillingRunType::Single.as_str(), &run.status);

        Ok((run, result))
    }

    /// One-time purchase of a membership type.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    pub async fn place_order(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        membership_type_id: Uuid,
        payment_method_id: Option<Uuid>,
    ) -> Result<Order, AppError> {
        let customer = self
            .store
            .get_customer(tenant_id, customer_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer {} not found", customer_id)))?;
        let membership_type = self
            .store
            .get_membership_type(tenant_id, membership_type_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Membership type {} not found",
                    membership_type_id
                ))
            })?;
        if !membership_type.is_active {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Membership type {} is not available",
                membership_type.name
            )));
        }

        let method = match payment_method_id {
            Some(id) => self
                .store
                .get_payment_method(tenant_id, id)
                .await?
                .filter(|m| m.customer_id == customer_id)
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Payment method {} not found", id))
                })?,
            None => self
                .store
                .default_payment_method(tenant_id, customer_id)
                .await?
                .ok_or_else(|| {
                    AppError::PaymentRequired(anyhow::anyhow!("No payment method on file"))
                })?,
        };
        let provider: Provider = method.provider.parse()?;

        let (order, invoice) = self
            .store
            .create_order(&crate::models::CreateOrder {
                tenant_id,
                customer_id,
                membership_type_id,
                payment_method_id: Some(method.payment_method_id),
                amount: membership_type.price,
                currency: membership_type.currency.clone(),
            })
            .await?;

        let request = ChargeRequest {
            idempotency_key: format!("order:{}", order.order_id),
            amount: order.amount,
            currency: order.currency.clone(),
            customer_ref: customer.provider_customer_ref.clone(),
            payment_method_ref: method.provider_method_ref.clone(),
            description: format!("{} ({})", membership_type.name, invoice.invoice_number),
            invoice_id: invoice.invoice_id,
        };

        // A transient failure leaves the order pending with its outcome unknown
        let charged = self.charge(provider, &request).await?;
        let now = Utc::now();
        let result = match charged {
            ChargeOutcome::Approved {
                provider_payment_ref,
            } => Ok(provider_payment_ref),
            ChargeOutcome::Declined { code, message, .. } => Err((code, message)),
        };
        let declined = result.as_ref().err().cloned();

        let outcome = ledger::order_outcome(
            &order,
            &invoice,
            provider.as_str(),
            membership_type.duration_days,
            result,
            now,
        );
        let order = self.store.record_order_outcome(&outcome).await?;

        if let Some((code, message)) = declined {
            record_billing_attempt(provider.as_str(), "declined");
            warn!(order_id = %order.order_id, code = %code, "Order payment declined");
            return Err(AppError::PaymentRequired(anyhow::anyhow!(
                "Payment declined for order {}: {} ({})",
                order.order_id,
                message,
                code
            )));
        }

        record_billing_attempt(provider.as_str(), "approved");
        record_payment_amount(&order.currency, "order", order.amount.to_f64().unwrap_or(0.0));
        info!(order_id = %order.order_id, "Order paid");

        Ok(order)
    }

    async fn resolve_payment_method(
        &self,
        sub: &Subscription,
    ) -> Result<Option<PaymentMethod>, AppError> {
        if let Some(id) = sub.payment_method_id {
            if let Some(method) = self.store.get_payment_method(sub.tenant_id, id).await? {
                return Ok(Some(method));
            }
            warn!(payment_method_id = %id, "Subscription payment method missing, using default");
        }
        self.store
            .default_payment_method(sub.tenant_id, sub.customer_id)
            .await
    }

    async fn charge(
        &self,
        provider: Provider,
        request: &ChargeRequest,
    ) -> Result<ChargeOutcome, ProviderError> {
        let adapter = self.providers.get(provider)?;
        let started = Instant::now();
        let result = retry_call(&self.call_retry, "provider.charge", || {
            adapter.charge(request)
        })
        .await;
        record_provider_duration(provider.as_str(), "charge", started.elapsed().as_secs_f64());
        result
    }
}
