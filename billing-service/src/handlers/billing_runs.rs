use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{BillingRunDetailResponse, ListBillingRunsQuery, ListResponse};
use crate::middleware::TenantContext;
use crate::models::{
    BillingRun, BillingRunStatus, BillingRunType, ListBillingRunsFilter,
};
use crate::startup::AppState;

/// Run a manual billing pass over the tenant's due subscriptions.
pub async fn trigger_billing_run(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Result<Json<BillingRunDetailResponse>, AppError> {
    tracing::info!(tenant_id = %tenant.tenant_id, "Manual billing run requested");

    let runs = state
        .engine
        .run_pass(Some(tenant.tenant_id), BillingRunType::Manual)
        .await?;
    let run = runs
        .into_iter()
        .find(|r| r.tenant_id == tenant.tenant_id)
        .ok_or_else(|| AppError::InternalError(anyhow::anyhow!("Billing run was not recorded")))?;
    let results = state.store.get_billing_run_results(run.run_id).await?;

    Ok(Json(BillingRunDetailResponse { run, results }))
}

pub async fn get_billing_run(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(run_id): Path<Uuid>,
) -> Result<Json<BillingRunDetailResponse>, AppError> {
    let run = state
        .store
        .get_billing_run(tenant.tenant_id, run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Billing run not found")))?;
    let results = state.store.get_billing_run_results(run_id).await?;
    Ok(Json(BillingRunDetailResponse { run, results }))
}

pub async fn list_billing_runs(
    State(state): State<AppState>,
    tenant: TenantContext,
    Query(query): Query<ListBillingRunsQuery>,
) -> Result<Json<ListResponse<BillingRun>>, AppError> {
    query.validate()?;
    let status = match query.status.as_deref() {
        None => None,
        Some(s @ ("running" | "completed" | "failed")) => Some(BillingRunStatus::from_string(s)),
        Some(other) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Unknown run status '{}'",
                other
            )))
        }
    };
    let run_type = match query.run_type.as_deref() {
        None => None,
        Some(t @ ("scheduled" | "manual" | "single")) => Some(BillingRunType::from_string(t)),
        Some(other) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Unknown run type '{}'",
                other
            )))
        }
    };

    let filter = ListBillingRunsFilter {
        status,
        run_type,
        page_size: query.page_size.unwrap_or(0),
        page_token: query.page_token,
    };
    let runs = state.store.list_billing_runs(tenant.tenant_id, &filter).await?;
    Ok(Json(ListResponse::page(runs, query.page_size, |r| r.run_id)))
}
