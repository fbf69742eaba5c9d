use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{CreateCustomerRequest, ListQuery, ListResponse};
use crate::middleware::TenantContext;
use crate::models::{CreateCustomer, ProviderCustomer};
use crate::startup::AppState;

/// Register a customer entity for a user or a guest.
pub async fn create_customer(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateCustomerRequest>,
) -> Result<(StatusCode, Json<ProviderCustomer>), AppError> {
    payload.validate()?;

    let guest_email = payload
        .guest_email
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty());
    if payload.user_id.is_none() && guest_email.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Either user_id or guest_email must be provided"
        )));
    }

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        provider = %payload.provider,
        guest = payload.user_id.is_none(),
        "Creating customer"
    );

    let customer = state
        .store
        .create_customer(&CreateCustomer {
            tenant_id: tenant.tenant_id,
            user_id: payload.user_id,
            guest_email,
            display_name: payload.display_name,
            provider: payload.provider,
            provider_customer_ref: payload.provider_customer_ref,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn get_customer(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(customer_id): Path<Uuid>,
) -> Result<Json<ProviderCustomer>, AppError> {
    let customer = state
        .store
        .get_customer(tenant.tenant_id, customer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;
    Ok(Json(customer))
}

pub async fn list_customers(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<ProviderCustomer>>, AppError> {
    query.validate()?;
    let customers = state
        .store
        .list_customers(
            tenant.tenant_id,
            query.page_size.unwrap_or(0),
            query.page_token,
        )
        .await?;
    Ok(Json(ListResponse::page(customers, query.page_size, |c| {
        c.customer_id
    })))
}
