//! Provider webhook endpoint. Not tenant-scoped; the provider signature is
//! the only authentication.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use service_core::error::AppError;

use crate::dtos::WebhookResponse;
use crate::models::Provider;
use crate::startup::AppState;

pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let provider: Provider = provider
        .parse()
        .map_err(AppError::NotFound)?;

    let applied = state.webhooks.process(provider, &headers, &body).await?;

    Ok(Json(WebhookResponse {
        status: applied.as_str(),
    }))
}
