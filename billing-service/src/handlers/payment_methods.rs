use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::CreatePaymentMethodRequest;
use crate::middleware::TenantContext;
use crate::models::{CreatePaymentMethod, PaymentMethod, ProviderCustomer};
use crate::startup::AppState;

async fn customer_in_tenant(
    state: &AppState,
    tenant: &TenantContext,
    customer_id: Uuid,
) -> Result<ProviderCustomer, AppError> {
    state
        .store
        .get_customer(tenant.tenant_id, customer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))
}

/// Store a tokenized payment method. Card data never reaches this service.
pub async fn create_payment_method(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(customer_id): Path<Uuid>,
    Json(payload): Json<CreatePaymentMethodRequest>,
) -> Result<(StatusCode, Json<PaymentMethod>), AppError> {
    payload.validate()?;
    customer_in_tenant(&state, &tenant, customer_id).await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        customer_id = %customer_id,
        provider = %payload.provider,
        is_default = payload.is_default,
        "Adding payment method"
    );

    let method = state
        .store
        .create_payment_method(&CreatePaymentMethod {
            tenant_id: tenant.tenant_id,
            customer_id,
            provider: payload.provider,
            provider_method_ref: payload.provider_method_ref,
            kind: payload.kind,
            brand: payload.brand,
            last4: payload.last4,
            exp_month: payload.exp_month,
            exp_year: payload.exp_year,
            is_default: payload.is_default,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(method)))
}

pub async fn list_payment_methods(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<Vec<PaymentMethod>>, AppError> {
    customer_in_tenant(&state, &tenant, customer_id).await?;
    let methods = state
        .store
        .list_payment_methods(tenant.tenant_id, customer_id)
        .await?;
    Ok(Json(methods))
}
