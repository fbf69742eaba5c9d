use axum::{
    extract::{Query, State},
    Json,
};
use service_core::error::AppError;

use crate::dtos::MembershipsQuery;
use crate::middleware::TenantContext;
use crate::models::UserMembership;
use crate::startup::AppState;

pub async fn list_memberships(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<MembershipsQuery>,
) -> Result<Json<Vec<UserMembership>>, AppError> {
    state
        .store
        .get_customer(tenant.tenant_id, query.customer_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Customer not found")))?;
    let memberships = state
        .store
        .list_memberships(tenant.tenant_id, query.customer_id)
        .await?;
    Ok(Json(memberships))
}
