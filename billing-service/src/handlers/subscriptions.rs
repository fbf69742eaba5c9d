//! Subscription lifecycle handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Days, Utc};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    BillNowResponse, CancelSubscriptionRequest, CreateSubscriptionRequest, ListResponse,
    ListSubscriptionsQuery,
};
use crate::middleware::TenantContext;
use crate::models::{
    BillingStatus, CreateSubscription, Invoice, ListSubscriptionsFilter, Subscription,
};
use crate::startup::AppState;

/// Subscribe a customer to a recurring membership type. Price, currency and
/// interval are copied from the membership type at creation time.
pub async fn create_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<Subscription>), AppError> {
    payload.validate()?;

    state
        .store
        .get_customer(tenant.tenant_id, payload.customer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;

    let membership_type = state
        .store
        .get_membership_type(tenant.tenant_id, payload.membership_type_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Membership type not found")))?;
    if !membership_type.is_active {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Membership type {} is not available",
            membership_type.name
        )));
    }
    if !membership_type.is_recurring {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Membership type {} is one-time; place an order instead",
            membership_type.name
        )));
    }

    if let Some(payment_method_id) = payload.payment_method_id {
        state
            .store
            .get_payment_method(tenant.tenant_id, payment_method_id)
            .await?
            .filter(|m| m.customer_id == payload.customer_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment method not found")))?;
    }

    let start_date = payload.start_date.unwrap_or_else(|| Utc::now().date_naive());
    let trial_end_date = match payload.trial_days {
        Some(days) if days > 0 => Some(
            start_date
                .checked_add_days(Days::new(days as u64))
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Trial end out of range")))?,
        ),
        _ => None,
    };

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        customer_id = %payload.customer_id,
        membership_type_id = %membership_type.membership_type_id,
        start_date = %start_date,
        trial = trial_end_date.is_some(),
        "Creating subscription"
    );

    let subscription = state
        .store
        .create_subscription(&CreateSubscription {
            tenant_id: tenant.tenant_id,
            customer_id: payload.customer_id,
            membership_type_id: membership_type.membership_type_id,
            payment_method_id: payload.payment_method_id,
            amount: membership_type.price,
            currency: membership_type.currency.clone(),
            billing_interval: membership_type.interval()?,
            interval_count: membership_type.interval_count,
            start_date,
            trial_end_date,
            max_retry_attempts: payload
                .max_retry_attempts
                .unwrap_or(state.config.billing.max_retry_attempts),
            metadata: payload.metadata,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    let subscription = state
        .store
        .get_subscription(tenant.tenant_id, subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
    Ok(Json(subscription))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListSubscriptionsQuery>,
) -> Result<Json<ListResponse<Subscription>>, AppError> {
    query.validate()?;
    let status = query
        .status
        .as_deref()
        .map(|s| {
            BillingStatus::parse(s)
                .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Unknown status '{}'", s)))
        })
        .transpose()?;

    let filter = ListSubscriptionsFilter {
        customer_id: query.customer_id,
        status,
        page_size: query.page_size.unwrap_or(0),
        page_token: query.page_token,
    };
    let subscriptions = state
        .store
        .list_subscriptions(tenant.tenant_id, &filter)
        .await?;
    Ok(Json(ListResponse::page(subscriptions, query.page_size, |s| {
        s.subscription_id
    })))
}

/// Cancel now, or at the end of the paid-through period (the default).
pub async fn cancel_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
    payload: Option<Json<CancelSubscriptionRequest>>,
) -> Result<Json<Subscription>, AppError> {
    let Json(payload) = payload.unwrap_or_default();

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        subscription_id = %subscription_id,
        at_period_end = payload.at_period_end,
        "Cancelling subscription"
    );

    let subscription = state
        .store
        .cancel_subscription(
            tenant.tenant_id,
            subscription_id,
            payload.at_period_end,
            Utc::now(),
        )
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
    Ok(Json(subscription))
}

pub async fn reactivate_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Subscription>, AppError> {
    tracing::info!(
        tenant_id = %tenant.tenant_id,
        subscription_id = %subscription_id,
        "Reactivating subscription"
    );

    let subscription = state
        .store
        .reactivate_subscription(tenant.tenant_id, subscription_id, Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
    Ok(Json(subscription))
}

/// Bill a due or past-due subscription immediately, outside the scheduler.
pub async fn bill_subscription(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<BillNowResponse>, AppError> {
    let (run, result) = state
        .engine
        .bill_subscription_now(tenant.tenant_id, subscription_id)
        .await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        subscription_id = %subscription_id,
        run_id = %run.run_id,
        result = result.status.as_str(),
        "Subscription billed on demand"
    );

    Ok(Json(BillNowResponse {
        run,
        result: result.into(),
    }))
}

pub async fn list_subscription_invoices(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(subscription_id): Path<Uuid>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    state
        .store
        .get_subscription(tenant.tenant_id, subscription_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Subscription not found")))?;
    let invoices = state
        .store
        .list_invoices(tenant.tenant_id, subscription_id)
        .await?;
    Ok(Json(invoices))
}
