use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::InvoiceDetailResponse;
use crate::middleware::TenantContext;
use crate::startup::AppState;

pub async fn get_invoice(
    State(state): State<AppState>,
    tenant: TenantContext,
    Path(invoice_id): Path<Uuid>,
) -> Result<Json<InvoiceDetailResponse>, AppError> {
    let invoice = state
        .store
        .get_invoice(tenant.tenant_id, invoice_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice not found")))?;
    let payments = state
        .store
        .list_payments_for_invoice(tenant.tenant_id, invoice_id)
        .await?;
    Ok(Json(InvoiceDetailResponse { invoice, payments }))
}
