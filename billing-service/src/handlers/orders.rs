use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::CreateOrderRequest;
use crate::middleware::TenantContext;
use crate::models::Order;
use crate::startup::AppState;

/// Buy a membership type once. Responds 402 when the charge is declined.
pub async fn create_order(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    tracing::info!(
        tenant_id = %tenant.tenant_id,
        customer_id = %payload.customer_id,
        membership_type_id = %payload.membership_type_id,
        "Placing order"
    );

    let order = state
        .engine
        .place_order(
            tenant.tenant_id,
            payload.customer_id,
            payload.membership_type_id,
            payload.payment_method_id,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn get_order(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .store
        .get_order(tenant.tenant_id, order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order not found")))?;
    Ok(Json(order))
}
