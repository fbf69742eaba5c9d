use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{CreateMembershipTypeRequest, ListMembershipTypesQuery};
use crate::middleware::TenantContext;
use crate::models::{BillingInterval, CreateMembershipType, MembershipType};
use crate::startup::AppState;

pub async fn create_membership_type(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateMembershipTypeRequest>,
) -> Result<(StatusCode, Json<MembershipType>), AppError> {
    payload.validate()?;

    let billing_interval = BillingInterval::parse(&payload.billing_interval).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "Unknown billing interval '{}'",
            payload.billing_interval
        ))
    })?;
    if payload.is_recurring && payload.duration_days.is_some() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "duration_days applies only to one-time membership types"
        )));
    }

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        name = %payload.name,
        price = %payload.price,
        interval = billing_interval.as_str(),
        "Creating membership type"
    );

    let membership_type = state
        .store
        .create_membership_type(&CreateMembershipType {
            tenant_id: tenant.tenant_id,
            name: payload.name,
            description: payload.description,
            features: payload.features,
            price: payload.price,
            currency: payload.currency.to_ascii_uppercase(),
            billing_interval,
            interval_count: payload.interval_count,
            is_recurring: payload.is_recurring,
            duration_days: payload.duration_days,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(membership_type)))
}

pub async fn get_membership_type(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(membership_type_id): Path<Uuid>,
) -> Result<Json<MembershipType>, AppError> {
    let membership_type = state
        .store
        .get_membership_type(tenant.tenant_id, membership_type_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Membership type not found")))?;
    Ok(Json(membership_type))
}

pub async fn list_membership_types(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListMembershipTypesQuery>,
) -> Result<Json<Vec<MembershipType>>, AppError> {
    let types = state
        .store
        .list_membership_types(tenant.tenant_id, query.active_only)
        .await?;
    Ok(Json(types))
}
