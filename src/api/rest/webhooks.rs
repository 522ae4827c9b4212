use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;

use crate::courier::ProviderStatusWebhook;
use crate::engine::lifecycle::WebhookOutcome;
use crate::error::AppError;
use crate::state::AppState;

pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/courier", post(courier_status))
}

async fn courier_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<ProviderStatusWebhook>,
) -> Result<Json<WebhookOutcome>, AppError> {
    if let Some(expected) = &state.webhook_token {
        let supplied = headers
            .get(WEBHOOK_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());
        if supplied != Some(expected.as_str()) {
            return Err(AppError::Unauthorized("invalid webhook token".to_string()));
        }
    }

    if payload.shipment_ref.trim().is_empty() {
        return Err(AppError::BadRequest("shipment_ref cannot be empty".to_string()));
    }

    Ok(Json(state.engine.handle_provider_webhook(payload).await?))
}
