use axum::{extract::State, Json};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::VerifyAccessRequest;
use crate::middleware::TenantContext;
use crate::services::AccessDecision;
use crate::startup::AppState;

/// Whether a customer currently holds a membership granting `feature`.
/// A denial is a normal 200 response with `allowed: false`.
pub async fn verify_access(
    State(state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<VerifyAccessRequest>,
) -> Result<Json<AccessDecision>, AppError> {
    payload.validate()?;
    let decision = state
        .access
        .verify_access(
            tenant.tenant_id,
            payload.customer_id,
            &payload.feature,
            Utc::now(),
        )
        .await?;

    tracing::info!(
        tenant_id = %tenant.tenant_id,
        customer_id = %payload.customer_id,
        feature = %payload.feature,
        allowed = decision.allowed,
        reason = %decision.reason,
        "Access verified"
    );

    Ok(Json(decision))
}
