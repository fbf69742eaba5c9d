//! PostgreSQL [`BillingStore`].

use super::store::{
    clamp_page_size, held_lease_conflict, initial_schedule, monthly_amount, trial_membership,
    BillingStore, RunTotals, WebhookApplication,
};
use crate::models::{
    invoice_number, start_of_day, AnalyticsSnapshot, BillResultStatus, BillingInterval,
    BillingRun, BillingRunResult, BillingRunStatus, BillingRunType, BillingStatus, CreateCustomer,
    CreateMembershipType, CreateOrder, CreatePaymentMethod, CreateSubscription, Invoice,
    InvoiceStatus, ListBillingRunsFilter, ListSubscriptionsFilter, MembershipStatus,
    MembershipType, MetricType, NewMembership, NewPayment, Order, OrderStatus, Payment,
    PaymentMethod, PaymentStatus, ProviderCustomer, Subscription, UserMembership,
};
use crate::providers::{Provider, ProviderEvent, ProviderEventKind};
use crate::services::ledger::{BillingOutcome, InvoiceUpdate, MembershipUpdate, OrderOutcome};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTION_COLUMNS: &str = "subscription_id, tenant_id, customer_id, membership_type_id, payment_method_id, billing_status, amount, currency, billing_interval, interval_count, start_date, trial_end_date, current_period_start, current_period_end, next_billing_date, billing_retry_count, max_retry_attempts, last_billing_attempt, cancel_at_period_end, cancelled_utc, lease_owner, lease_expires_utc, metadata, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, customer_id, subscription_id, order_id, invoice_number, amount, currency, status, period_start, period_end, attempt_count, paid_utc, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, tenant_id, invoice_id, customer_id, provider, provider_payment_ref, amount, currency, status, failure_code, failure_message, attempt_number, idempotency_key, refunded_utc, created_utc, updated_utc";

const ORDER_COLUMNS: &str = "order_id, tenant_id, customer_id, membership_type_id, payment_method_id, amount, currency, status, invoice_id, created_utc, updated_utc";

const MEMBERSHIP_TYPE_COLUMNS: &str = "membership_type_id, tenant_id, name, description, features, price, currency, billing_interval, interval_count, is_recurring, duration_days, is_active, created_utc, updated_utc";

const MEMBERSHIP_COLUMNS: &str = "membership_id, tenant_id, customer_id, membership_type_id, subscription_id, order_id, status, starts_utc, expires_utc, created_utc, updated_utc";

const CUSTOMER_COLUMNS: &str = "customer_id, tenant_id, user_id, guest_email, display_name, provider, provider_customer_ref, created_utc, updated_utc";

const PAYMENT_METHOD_COLUMNS: &str = "payment_method_id, tenant_id, customer_id, provider, provider_method_ref, kind, brand, last4, exp_month, exp_year, is_default, created_utc";

const RUN_COLUMNS: &str = "run_id, tenant_id, run_type, status, started_utc, completed_utc, subscriptions_processed, subscriptions_succeeded, subscriptions_failed, error_message";

const SNAPSHOT_COLUMNS: &str = "snapshot_id, tenant_id, snapshot_date, metric_type, currency, value, sample_count, computed_utc";

fn db_error(action: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(skip(database_url), fields(service = "billing-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))
    }

    async fn insert_payment(
        tx: &mut Transaction<'_, Postgres>,
        input: &NewPayment,
    ) -> Result<Payment, AppError> {
        sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, tenant_id, invoice_id, customer_id, provider, provider_payment_ref, amount, currency, status, failure_code, failure_message, attempt_number, idempotency_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(input.invoice_id)
        .bind(input.customer_id)
        .bind(&input.provider)
        .bind(&input.provider_payment_ref)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.status.as_str())
        .bind(&input.failure_code)
        .bind(&input.failure_message)
        .bind(input.attempt_number)
        .bind(&input.idempotency_key)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Payment already recorded for {}",
                    input.idempotency_key
                ))
            } else {
                db_error("insert payment", e)
            }
        })
    }

    async fn update_invoice(
        tx: &mut Transaction<'_, Postgres>,
        update: &InvoiceUpdate,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = $2, attempt_count = attempt_count + 1, paid_utc = COALESCE($3, paid_utc), updated_utc = NOW()
            WHERE invoice_id = $1
            "#,
        )
        .bind(update.invoice_id)
        .bind(update.status.as_str())
        .bind(update.paid_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("update invoice", e))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                update.invoice_id
            )));
        }
        Ok(())
    }

    async fn insert_membership(
        tx: &mut Transaction<'_, Postgres>,
        input: &NewMembership,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO user_memberships (membership_id, tenant_id, customer_id, membership_type_id, subscription_id, order_id, status, starts_utc, expires_utc)
            VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8)
            ON CONFLICT (subscription_id) WHERE subscription_id IS NOT NULL
            DO UPDATE SET status = 'active', membership_type_id = EXCLUDED.membership_type_id,
                expires_utc = EXCLUDED.expires_utc, updated_utc = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.membership_type_id)
        .bind(input.subscription_id)
        .bind(input.order_id)
        .bind(input.starts_utc)
        .bind(input.expires_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("upsert membership", e))?;
        Ok(())
    }

    async fn set_subscription_membership_status(
        tx: &mut Transaction<'_, Postgres>,
        subscription_id: Uuid,
        status: MembershipStatus,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE user_memberships SET status = $2, updated_utc = NOW() WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("update membership status", e))?;
        Ok(())
    }

    async fn lock_subscription(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| db_error("lock subscription", e))
    }

    async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), AppError> {
        tx.commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }
}

#[async_trait]
impl BillingStore for PgStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Customers
    // =========================================================================

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    async fn create_customer(&self, input: &CreateCustomer) -> Result<ProviderCustomer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, ProviderCustomer>(&format!(
            r#"
            INSERT INTO provider_customers (customer_id, tenant_id, user_id, guest_email, display_name, provider, provider_customer_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {}
            "#,
            CUSTOMER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(input.user_id)
        .bind(&input.guest_email)
        .bind(&input.display_name)
        .bind(input.provider.as_str())
        .bind(&input.provider_customer_ref)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Customer {} already exists for {}",
                    input.provider_customer_ref,
                    input.provider
                ))
            } else {
                db_error("create customer", e)
            }
        })?;

        timer.observe_duration();
        info!(customer_id = %customer.customer_id, guest = customer.is_guest(), "Customer created");

        Ok(customer)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn get_customer(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<ProviderCustomer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_customer"])
            .start_timer();

        let customer = sqlx::query_as::<_, ProviderCustomer>(&format!(
            "SELECT {} FROM provider_customers WHERE tenant_id = $1 AND customer_id = $2",
            CUSTOMER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get customer", e))?;

        timer.observe_duration();
        Ok(customer)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_customers(
        &self,
        tenant_id: Uuid,
        page_size: i32,
        page_token: Option<Uuid>,
    ) -> Result<Vec<ProviderCustomer>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_customers"])
            .start_timer();

        let customers = sqlx::query_as::<_, ProviderCustomer>(&format!(
            r#"
            SELECT {}
            FROM provider_customers
            WHERE tenant_id = $1 AND ($2::uuid IS NULL OR customer_id > $2)
            ORDER BY customer_id
            LIMIT $3
            "#,
            CUSTOMER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(page_token)
        .bind(clamp_page_size(page_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list customers", e))?;

        timer.observe_duration();
        Ok(customers)
    }

    // =========================================================================
    // Payment methods
    // =========================================================================

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, customer_id = %input.customer_id))]
    async fn create_payment_method(
        &self,
        input: &CreatePaymentMethod,
    ) -> Result<PaymentMethod, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment_method"])
            .start_timer();

        let mut tx = self.begin().await?;

        // Lock the customer row so concurrent inserts agree on the default
        let exists = sqlx::query_scalar::<_, Uuid>(
            "SELECT customer_id FROM provider_customers WHERE tenant_id = $1 AND customer_id = $2 FOR UPDATE",
        )
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock customer", e))?;
        if exists.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Customer {} not found",
                input.customer_id
            )));
        }

        let existing = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM payment_methods WHERE customer_id = $1",
        )
        .bind(input.customer_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("count payment methods", e))?;

        let is_default = input.is_default || existing == 0;
        if is_default {
            sqlx::query("UPDATE payment_methods SET is_default = FALSE WHERE customer_id = $1 AND is_default")
                .bind(input.customer_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("clear default payment method", e))?;
        }

        let method = sqlx::query_as::<_, PaymentMethod>(&format!(
            r#"
            INSERT INTO payment_methods (payment_method_id, tenant_id, customer_id, provider, provider_method_ref, kind, brand, last4, exp_month, exp_year, is_default)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.provider.as_str())
        .bind(&input.provider_method_ref)
        .bind(&input.kind)
        .bind(&input.brand)
        .bind(&input.last4)
        .bind(input.exp_month)
        .bind(input.exp_year)
        .bind(is_default)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Payment method {} already stored",
                    input.provider_method_ref
                ))
            } else {
                db_error("create payment method", e)
            }
        })?;

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(payment_method_id = %method.payment_method_id, is_default, "Payment method stored");

        Ok(method)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_payment_method(
        &self,
        tenant_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        sqlx::query_as::<_, PaymentMethod>(&format!(
            "SELECT {} FROM payment_methods WHERE tenant_id = $1 AND payment_method_id = $2",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_method_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get payment method", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn list_payment_methods(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<PaymentMethod>, AppError> {
        sqlx::query_as::<_, PaymentMethod>(&format!(
            "SELECT {} FROM payment_methods WHERE tenant_id = $1 AND customer_id = $2 ORDER BY created_utc",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list payment methods", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn default_payment_method(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Option<PaymentMethod>, AppError> {
        sqlx::query_as::<_, PaymentMethod>(&format!(
            "SELECT {} FROM payment_methods WHERE tenant_id = $1 AND customer_id = $2 AND is_default",
            PAYMENT_METHOD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get default payment method", e))
    }

    // =========================================================================
    // Membership types
    // =========================================================================

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    async fn create_membership_type(
        &self,
        input: &CreateMembershipType,
    ) -> Result<MembershipType, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_membership_type"])
            .start_timer();

        let membership_type = sqlx::query_as::<_, MembershipType>(&format!(
            r#"
            INSERT INTO membership_types (membership_type_id, tenant_id, name, description, features, price, currency, billing_interval, interval_count, is_recurring, duration_days)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {}
            "#,
            MEMBERSHIP_TYPE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.features)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.billing_interval.as_str())
        .bind(input.interval_count)
        .bind(input.is_recurring)
        .bind(input.duration_days)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                AppError::Conflict(anyhow::anyhow!(
                    "Membership type {} already exists",
                    input.name
                ))
            } else {
                db_error("create membership type", e)
            }
        })?;

        timer.observe_duration();
        info!(membership_type_id = %membership_type.membership_type_id, name = %membership_type.name, "Membership type created");

        Ok(membership_type)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_membership_type(
        &self,
        tenant_id: Uuid,
        membership_type_id: Uuid,
    ) -> Result<Option<MembershipType>, AppError> {
        sqlx::query_as::<_, MembershipType>(&format!(
            "SELECT {} FROM membership_types WHERE tenant_id = $1 AND membership_type_id = $2",
            MEMBERSHIP_TYPE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(membership_type_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get membership type", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_membership_types(
        &self,
        tenant_id: Uuid,
        active_only: bool,
    ) -> Result<Vec<MembershipType>, AppError> {
        sqlx::query_as::<_, MembershipType>(&format!(
            "SELECT {} FROM membership_types WHERE tenant_id = $1 AND (NOT $2 OR is_active) ORDER BY name",
            MEMBERSHIP_TYPE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list membership types", e))
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, customer_id = %input.customer_id))]
    async fn create_subscription(
        &self,
        input: &CreateSubscription,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_subscription"])
            .start_timer();

        let (period_start, period_end, next_billing_date) = initial_schedule(input);
        let subscription_id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            INSERT INTO subscriptions (subscription_id, tenant_id, customer_id, membership_type_id, payment_method_id, billing_status, amount, currency, billing_interval, interval_count, start_date, trial_end_date, current_period_start, current_period_end, next_billing_date, max_retry_attempts, metadata)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.membership_type_id)
        .bind(input.payment_method_id)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.billing_interval.as_str())
        .bind(input.interval_count)
        .bind(input.start_date)
        .bind(input.trial_end_date)
        .bind(period_start)
        .bind(period_end)
        .bind(next_billing_date)
        .bind(input.max_retry_attempts)
        .bind(&input.metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("create subscription", e))?;

        if let Some(trial) = trial_membership(input, subscription_id) {
            Self::insert_membership(&mut tx, &trial).await?;
        }

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(subscription_id = %subscription.subscription_id, next_billing_date = %next_billing_date, "Subscription created");

        Ok(subscription)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {} FROM subscriptions WHERE tenant_id = $1 AND subscription_id = $2",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get subscription", e))?;

        timer.observe_duration();
        Ok(subscription)
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_subscriptions(
        &self,
        tenant_id: Uuid,
        filter: &ListSubscriptionsFilter,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_subscriptions"])
            .start_timer();

        let status = filter.status.map(|s| s.as_str());
        let subscriptions = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            SELECT {}
            FROM subscriptions
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR customer_id = $2)
              AND ($3::varchar IS NULL OR billing_status = $3)
              AND ($4::uuid IS NULL OR subscription_id > $4)
            ORDER BY subscription_id
            LIMIT $5
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(filter.customer_id)
        .bind(status)
        .bind(filter.page_token)
        .bind(clamp_page_size(filter.page_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list subscriptions", e))?;

        timer.observe_duration();
        Ok(subscriptions)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn cancel_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut tx = self.begin().await?;
        let Some(current) = Self::lock_subscription(&mut tx, tenant_id, subscription_id).await?
        else {
            return Ok(None);
        };

        let status = current.try_status()?;
        if status == BillingStatus::Cancelled {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription is already cancelled"
            )));
        }

        let immediate = !at_period_end || status == BillingStatus::Suspended;
        if immediate && !current.lease_is_free(now) {
            return Err(held_lease_conflict());
        }
        let query = if immediate {
            format!(
                r#"
                UPDATE subscriptions
                SET billing_status = 'cancelled', cancelled_utc = $2, next_billing_date = NULL,
                    lease_owner = NULL, lease_expires_utc = NULL, updated_utc = $2
                WHERE subscription_id = $1
                RETURNING {}
                "#,
                SUBSCRIPTION_COLUMNS
            )
        } else {
            format!(
                "UPDATE subscriptions SET cancel_at_period_end = TRUE, updated_utc = $2 WHERE subscription_id = $1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            )
        };

        let subscription = sqlx::query_as::<_, Subscription>(&query)
            .bind(subscription_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("cancel subscription", e))?;

        if immediate {
            Self::set_subscription_membership_status(
                &mut tx,
                subscription_id,
                MembershipStatus::Cancelled,
            )
            .await?;
        }

        Self::commit(tx).await?;
        info!(immediate, "Subscription cancelled");
        Ok(Some(subscription))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn reactivate_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>, AppError> {
        let mut tx = self.begin().await?;
        let Some(current) = Self::lock_subscription(&mut tx, tenant_id, subscription_id).await?
        else {
            return Ok(None);
        };

        let query = match current.try_status()? {
            BillingStatus::Cancelled => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Cancelled subscriptions cannot be reactivated"
                )))
            }
            BillingStatus::Active if !current.cancel_at_period_end => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Subscription is already active"
                )))
            }
            BillingStatus::Active => format!(
                "UPDATE subscriptions SET cancel_at_period_end = FALSE, updated_utc = $2 WHERE subscription_id = $1 RETURNING {}",
                SUBSCRIPTION_COLUMNS
            ),
            BillingStatus::PastDue | BillingStatus::Suspended => format!(
                r#"
                UPDATE subscriptions
                SET billing_status = 'active', billing_retry_count = 0, cancel_at_period_end = FALSE,
                    next_billing_date = $2, updated_utc = $2
                WHERE subscription_id = $1
                RETURNING {}
                "#,
                SUBSCRIPTION_COLUMNS
            ),
        };

        let subscription = sqlx::query_as::<_, Subscription>(&query)
            .bind(subscription_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("reactivate subscription", e))?;

        Self::commit(tx).await?;
        info!("Subscription reactivated");
        Ok(Some(subscription))
    }

    #[instrument(skip(self), fields(owner = %owner))]
    async fn claim_due_subscriptions(
        &self,
        tenant_id: Option<Uuid>,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_due_subscriptions"])
            .start_timer();

        let claimed = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET lease_owner = $1, lease_expires_utc = $2, updated_utc = NOW()
            WHERE subscription_id IN (
                SELECT subscription_id
                FROM subscriptions
                WHERE ($3::uuid IS NULL OR tenant_id = $3)
                  AND billing_status IN ('active', 'past_due')
                  AND next_billing_date <= $4
                  AND (lease_owner IS NULL OR lease_expires_utc <= $4)
                ORDER BY next_billing_date
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(owner)
        .bind(lease_until)
        .bind(tenant_id)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("claim due subscriptions", e))?;

        timer.observe_duration();
        if !claimed.is_empty() {
            info!(count = claimed.len(), "Claimed due subscriptions");
        }
        Ok(claimed)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id, owner = %owner))]
    async fn claim_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Subscription, AppError> {
        let claimed = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET lease_owner = $3, lease_expires_utc = $5, updated_utc = NOW()
            WHERE tenant_id = $1 AND subscription_id = $2
              AND (billing_status = 'past_due'
                   OR (billing_status = 'active' AND next_billing_date <= $4))
              AND (lease_owner IS NULL OR lease_expires_utc <= $4)
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .bind(owner)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("claim subscription", e))?;

        if let Some(subscription) = claimed {
            return Ok(subscription);
        }

        match self.get_subscription(tenant_id, subscription_id).await? {
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                subscription_id
            ))),
            Some(sub) if !sub.lease_is_free(now) => Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription is being billed by another worker"
            ))),
            Some(sub) => Err(AppError::Conflict(anyhow::anyhow!(
                "Subscription is not due for billing (status {})",
                sub.billing_status
            ))),
        }
    }

    // =========================================================================
    // Invoices and payments
    // =========================================================================

    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id, period_start = %period_start))]
    async fn open_invoice(
        &self,
        subscription: &Subscription,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["open_invoice"])
            .start_timer();

        let invoice_id = Uuid::new_v4();
        let inserted = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, customer_id, subscription_id, invoice_number, amount, currency, status, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', $8, $9)
            ON CONFLICT (subscription_id, period_start) WHERE subscription_id IS NOT NULL DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(subscription.tenant_id)
        .bind(subscription.customer_id)
        .bind(subscription.subscription_id)
        .bind(invoice_number(invoice_id, period_start))
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("create invoice", e))?;

        let invoice = match inserted {
            Some(invoice) => invoice,
            None => sqlx::query_as::<_, Invoice>(&format!(
                "SELECT {} FROM invoices WHERE subscription_id = $1 AND period_start = $2",
                INVOICE_COLUMNS
            ))
            .bind(subscription.subscription_id)
            .bind(period_start)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("get period invoice", e))?,
        };

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get invoice", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn list_invoices(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND subscription_id = $2 ORDER BY period_start",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list invoices", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id))]
    async fn list_payments_for_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE tenant_id = $1 AND invoice_id = $2 ORDER BY attempt_number, created_utc",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list payments", e))
    }

    #[instrument(skip(self, outcome), fields(subscription_id = %outcome.subscription_id, status = %outcome.transition.status.as_str()))]
    async fn record_billing_outcome(
        &self,
        outcome: &BillingOutcome,
    ) -> Result<Subscription, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_billing_outcome"])
            .start_timer();

        let mut tx = self.begin().await?;

        let Some(current) =
            Self::lock_subscription(&mut tx, outcome.tenant_id, outcome.subscription_id).await?
        else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Subscription {} not found",
                outcome.subscription_id
            )));
        };
        if current.lease_owner.as_deref() != Some(outcome.lease_owner.as_str()) {
            tx.rollback().await.ok();
            warn!(
                lease_owner = ?current.lease_owner,
                expected = %outcome.lease_owner,
                "Lease lost before outcome commit"
            );
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Lease on subscription {} no longer held by {}",
                outcome.subscription_id,
                outcome.lease_owner
            )));
        }

        if let Some(update) = &outcome.invoice {
            Self::update_invoice(&mut tx, update).await?;
        }
        if let Some(payment) = &outcome.payment {
            Self::insert_payment(&mut tx, payment).await?;
        }
        match &outcome.membership {
            MembershipUpdate::Renew(renewal) => Self::insert_membership(&mut tx, renewal).await?,
            MembershipUpdate::SetStatus(status) => {
                Self::set_subscription_membership_status(&mut tx, outcome.subscription_id, *status)
                    .await?
            }
            MembershipUpdate::None => {}
        }

        let t = &outcome.transition;
        let subscription = sqlx::query_as::<_, Subscription>(&format!(
            r#"
            UPDATE subscriptions
            SET billing_status = $2, billing_retry_count = $3, current_period_start = $4,
                current_period_end = $5, next_billing_date = $6, last_billing_attempt = $7,
                cancel_at_period_end = CASE WHEN $2 = 'cancelled' THEN $8 ELSE cancel_at_period_end END,
                cancelled_utc = $9, lease_owner = NULL, lease_expires_utc = NULL, updated_utc = NOW()
            WHERE subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(outcome.subscription_id)
        .bind(t.status.as_str())
        .bind(t.billing_retry_count)
        .bind(t.current_period_start)
        .bind(t.current_period_end)
        .bind(t.next_billing_date)
        .bind(t.last_billing_attempt)
        .bind(t.cancel_at_period_end)
        .bind(t.cancelled_utc)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("update subscription", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(subscription)
    }

    // =========================================================================
    // Orders
    // =========================================================================

    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, customer_id = %input.customer_id))]
    async fn create_order(&self, input: &CreateOrder) -> Result<(Order, Invoice), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order"])
            .start_timer();

        let order_id = Uuid::new_v4();
        let invoice_id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (order_id, tenant_id, customer_id, membership_type_id, payment_method_id, amount, currency, status, invoice_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8)
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(input.membership_type_id)
        .bind(input.payment_method_id)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("create order", e))?;

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, customer_id, order_id, invoice_number, amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'open')
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(input.tenant_id)
        .bind(input.customer_id)
        .bind(order_id)
        .bind(invoice_number(invoice_id, order.created_utc.date_naive()))
        .bind(input.amount)
        .bind(&input.currency)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("create order invoice", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();
        info!(order_id = %order_id, "Order created");

        Ok((order, invoice))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id))]
    async fn get_order(&self, tenant_id: Uuid, order_id: Uuid) -> Result<Option<Order>, AppError> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {} FROM orders WHERE tenant_id = $1 AND order_id = $2",
            ORDER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get order", e))
    }

    #[instrument(skip(self, outcome), fields(order_id = %outcome.order_id, status = %outcome.status.as_str()))]
    async fn record_order_outcome(&self, outcome: &OrderOutcome) -> Result<Order, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_order_outcome"])
            .start_timer();

        let mut tx = self.begin().await?;

        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM orders WHERE tenant_id = $1 AND order_id = $2 FOR UPDATE",
        )
        .bind(outcome.tenant_id)
        .bind(outcome.order_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock order", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", outcome.order_id)))?;
        if status != OrderStatus::Pending.as_str() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Order {} is already {}",
                outcome.order_id,
                status
            )));
        }

        Self::insert_payment(&mut tx, &outcome.payment).await?;
        Self::update_invoice(&mut tx, &outcome.invoice).await?;
        if let Some(membership) = &outcome.membership {
            Self::insert_membership(&mut tx, membership).await?;
        }

        let order = sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders SET status = $2, updated_utc = NOW() WHERE order_id = $1 RETURNING {}",
            ORDER_COLUMNS
        ))
        .bind(outcome.order_id)
        .bind(outcome.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("update order", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();

        Ok(order)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn list_memberships(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<UserMembership>, AppError> {
        sqlx::query_as::<_, UserMembership>(&format!(
            "SELECT {} FROM user_memberships WHERE tenant_id = $1 AND customer_id = $2 ORDER BY created_utc",
            MEMBERSHIP_COLUMNS
        ))
        .bind(tenant_id)
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list memberships", e))
    }

    // =========================================================================
    // Billing runs
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn create_billing_run(
        &self,
        tenant_id: Uuid,
        run_type: BillingRunType,
    ) -> Result<BillingRun, AppError> {
        sqlx::query_as::<_, BillingRun>(&format!(
            "INSERT INTO billing_runs (run_id, tenant_id, run_type, status) VALUES ($1, $2, $3, $4) RETURNING {}",
            RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(run_type.as_str())
        .bind(BillingRunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create billing run", e))
    }

    #[instrument(skip(self, error_message), fields(run_id = %run_id))]
    async fn add_billing_run_result(
        &self,
        run_id: Uuid,
        subscription_id: Uuid,
        status: BillResultStatus,
        invoice_id: Option<Uuid>,
        error_message: Option<String>,
    ) -> Result<BillingRunResult, AppError> {
        sqlx::query_as::<_, BillingRunResult>(
            r#"
            INSERT INTO billing_run_results (result_id, run_id, subscription_id, status, invoice_id, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING result_id, run_id, subscription_id, status, invoice_id, error_message, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(subscription_id)
        .bind(status.as_str())
        .bind(invoice_id)
        .bind(error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("record billing run result", e))
    }

    #[instrument(skip(self, error_message), fields(run_id = %run_id))]
    async fn finish_billing_run(
        &self,
        run_id: Uuid,
        totals: RunTotals,
        error_message: Option<String>,
    ) -> Result<BillingRun, AppError> {
        sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            UPDATE billing_runs
            SET status = $2, completed_utc = NOW(), subscriptions_processed = $3,
                subscriptions_succeeded = $4, subscriptions_failed = $5, error_message = $6
            WHERE run_id = $1
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(totals.status().as_str())
        .bind(totals.processed)
        .bind(totals.succeeded)
        .bind(totals.failed + totals.errored)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("finish billing run", e))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Billing run {} not found", run_id)))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, run_id = %run_id))]
    async fn get_billing_run(
        &self,
        tenant_id: Uuid,
        run_id: Uuid,
    ) -> Result<Option<BillingRun>, AppError> {
        sqlx::query_as::<_, BillingRun>(&format!(
            "SELECT {} FROM billing_runs WHERE tenant_id = $1 AND run_id = $2",
            RUN_COLUMNS
        ))
        .bind(tenant_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get billing run", e))
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_billing_run_results(&self, run_id: Uuid) -> Result<Vec<BillingRunResult>, AppError> {
        sqlx::query_as::<_, BillingRunResult>(
            r#"
            SELECT result_id, run_id, subscription_id, status, invoice_id, error_message, created_utc
            FROM billing_run_results
            WHERE run_id = $1
            ORDER BY created_utc
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get billing run results", e))
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_billing_runs(
        &self,
        tenant_id: Uuid,
        filter: &ListBillingRunsFilter,
    ) -> Result<Vec<BillingRun>, AppError> {
        sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            SELECT {}
            FROM billing_runs
            WHERE tenant_id = $1
              AND ($2::varchar IS NULL OR status = $2)
              AND ($3::varchar IS NULL OR run_type = $3)
              AND ($4::uuid IS NULL OR run_id > $4)
            ORDER BY run_id
            LIMIT $5
            "#,
            RUN_COLUMNS
        ))
        .bind(tenant_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.run_type.map(|t| t.as_str()))
        .bind(filter.page_token)
        .bind(clamp_page_size(filter.page_size))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list billing runs", e))
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    #[instrument(skip(self, event), fields(provider = %provider, event_id = %event.event_id))]
    async fn apply_webhook_event(
        &self,
        provider: Provider,
        event: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookApplication, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_webhook_event"])
            .start_timer();

        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO webhook_events (provider, event_id, event_type, received_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, event_id) DO NOTHING
            "#,
        )
        .bind(provider.as_str())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("record webhook event", e))?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(WebhookApplication::Duplicate);
        }

        let reference = match &event.kind {
            ProviderEventKind::PaymentSucceeded(r)
            | ProviderEventKind::PaymentFailed(r)
            | ProviderEventKind::PaymentRefunded(r) => r,
            ProviderEventKind::Ignored => {
                Self::commit(tx).await?;
                return Ok(WebhookApplication::Applied);
            }
        };

        let payment = sqlx::query_as::<_, (Uuid, Uuid, String)>(
            r#"
            SELECT payment_id, invoice_id, status FROM payments
            WHERE provider = $1 AND provider_payment_ref = $2
            ORDER BY created_utc DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(provider.as_str())
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("find payment", e))?;

        let Some((payment_id, invoice_id, status)) = payment else {
            Self::commit(tx).await?;
            return Ok(WebhookApplication::UnknownReference);
        };
        let current = PaymentStatus::from_string(&status);

        match &event.kind {
            ProviderEventKind::PaymentSucceeded(_)
                if matches!(current, PaymentStatus::Pending | PaymentStatus::Failed) =>
            {
                sqlx::query("UPDATE payments SET status = 'succeeded', updated_utc = $2 WHERE payment_id = $1")
                    .bind(payment_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("update payment", e))?;
                sqlx::query(
                    "UPDATE invoices SET status = 'paid', paid_utc = $2, updated_utc = $2 WHERE invoice_id = $1 AND status = 'open'",
                )
                .bind(invoice_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("update invoice", e))?;
            }
            ProviderEventKind::PaymentFailed(_) if current == PaymentStatus::Pending => {
                sqlx::query("UPDATE payments SET status = 'failed', updated_utc = $2 WHERE payment_id = $1")
                    .bind(payment_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("update payment", e))?;
            }
            ProviderEventKind::PaymentRefunded(_) if current != PaymentStatus::Refunded => {
                sqlx::query(
                    "UPDATE payments SET status = 'refunded', refunded_utc = $2, updated_utc = $2 WHERE payment_id = $1",
                )
                .bind(payment_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("update payment", e))?;

                let order_id = sqlx::query_scalar::<_, Option<Uuid>>(
                    "UPDATE invoices SET status = 'void', updated_utc = $2 WHERE invoice_id = $1 RETURNING order_id",
                )
                .bind(invoice_id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("void invoice", e))?
                .flatten();

                if let Some(order_id) = order_id {
                    sqlx::query("UPDATE orders SET status = 'refunded', updated_utc = $2 WHERE order_id = $1")
                        .bind(order_id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| db_error("refund order", e))?;
                    sqlx::query(
                        "UPDATE user_memberships SET status = 'cancelled', updated_utc = $2 WHERE order_id = $1",
                    )
                    .bind(order_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_error("cancel order membership", e))?;
                }
            }
            _ => {}
        }

        Self::commit(tx).await?;
        timer.observe_duration();
        Ok(WebhookApplication::Applied)
    }

    // =========================================================================
    // Analytics
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id, date = %date))]
    async fn revenue_for_date(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        currency: &str,
    ) -> Result<(Decimal, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["revenue_for_date"])
            .start_timer();

        let from = start_of_day(date);
        let to = start_of_day(date.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX));

        let (gross, count) = sqlx::query_as::<_, (Decimal, i64)>(
            r#"
            SELECT COALESCE(SUM(amount), 0), COUNT(*)
            FROM payments
            WHERE tenant_id = $1 AND currency = $2
              AND status IN ('succeeded', 'refunded')
              AND created_utc >= $3 AND created_utc < $4
            "#,
        )
        .bind(tenant_id)
        .bind(currency)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("sum revenue", e))?;

        let refunds = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM payments
            WHERE tenant_id = $1 AND currency = $2
              AND refunded_utc >= $3 AND refunded_utc < $4
            "#,
        )
        .bind(tenant_id)
        .bind(currency)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("sum refunds", e))?;

        timer.observe_duration();
        Ok((gross - refunds, count))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn mrr(&self, tenant_id: Uuid, currency: &str) -> Result<(Decimal, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mrr"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Decimal, String, i32)>(
            r#"
            SELECT amount, billing_interval, interval_count
            FROM subscriptions
            WHERE tenant_id = $1 AND currency = $2 AND billing_status IN ('active', 'past_due')
            "#,
        )
        .bind(tenant_id)
        .bind(currency)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load recurring subscriptions", e))?;

        let total: Decimal = rows
            .iter()
            .filter_map(|(amount, interval, count)| match BillingInterval::parse(interval) {
                Some(interval) => Some(monthly_amount(*amount, interval, *count)),
                None => {
                    error!(tenant_id = %tenant_id, interval = %interval, "Skipping subscription with unknown billing interval");
                    None
                }
            })
            .sum();

        timer.observe_duration();
        Ok((total.round_dp(2), rows.len() as i64))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, metric = %metric.as_str()))]
    async fn get_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
    ) -> Result<Option<AnalyticsSnapshot>, AppError> {
        sqlx::query_as::<_, AnalyticsSnapshot>(&format!(
            r#"
            SELECT {} FROM analytics_snapshots
            WHERE tenant_id = $1 AND snapshot_date = $2 AND metric_type = $3 AND currency = $4
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(date)
        .bind(metric.as_str())
        .bind(currency)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get snapshot", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, metric = %metric.as_str()))]
    async fn upsert_snapshot(
        &self,
        tenant_id: Uuid,
        date: NaiveDate,
        metric: MetricType,
        currency: &str,
        value: Decimal,
        sample_count: i64,
    ) -> Result<AnalyticsSnapshot, AppError> {
        sqlx::query_as::<_, AnalyticsSnapshot>(&format!(
            r#"
            INSERT INTO analytics_snapshots (snapshot_id, tenant_id, snapshot_date, metric_type, currency, value, sample_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, snapshot_date, metric_type, currency)
            DO UPDATE SET value = EXCLUDED.value, sample_count = EXCLUDED.sample_count, computed_utc = NOW()
            RETURNING {}
            "#,
            SNAPSHOT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(date)
        .bind(metric.as_str())
        .bind(currency)
        .bind(value)
        .bind(sample_count)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("upsert snapshot", e))
    }
}
