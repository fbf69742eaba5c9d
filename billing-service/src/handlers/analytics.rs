use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use validator::Validate;

use crate::dtos::{MrrQuery, RevenueQuery};
use crate::middleware::TenantContext;
use crate::models::AnalyticsSnapshot;
use crate::startup::AppState;

pub async fn daily_revenue(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<RevenueQuery>,
) -> Result<Json<AnalyticsSnapshot>, AppError> {
    query.validate()?;
    let today = Utc::now().date_naive();
    let snapshot = state
        .analytics
        .daily_revenue(
            tenant.tenant_id,
            query.date.unwrap_or(today),
            &query.currency,
            today,
        )
        .await?;
    Ok(Json(snapshot))
}

pub async fn mrr(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<MrrQuery>,
) -> Result<Json<AnalyticsSnapshot>, AppError> {
    query.validate()?;
    let snapshot = state
        .analytics
        .mrr(tenant.tenant_id, &query.currency, Utc::now().date_naive())
        .await?;
    Ok(Json(snapshot))
}
