//! Stripe webhook endpoint
//!
//! The signature covers the raw body, so the payload is taken as bytes and
//! only parsed after verification. A 2xx is returned only once the event is
//! recorded as processed (or was already); every failure is non-2xx so
//! Stripe redelivers.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use creditline_billing::{BillingError, WebhookOutcome};
use serde::Serialize;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub event_id: String,
    pub outcome: WebhookOutcome,
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without Stripe-Signature header");
            ApiError::from(BillingError::InvalidSignature)
        })?;

    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::Validation("webhook payload is not valid UTF-8".to_string()))?;

    let webhooks = &state.billing.webhooks;
    let event = webhooks.verify_event(payload, signature)?;
    let event_id = event.id.clone();
    let outcome = webhooks.handle_event(event).await?;

    Ok(Json(WebhookAck {
        received: true,
        event_id,
        outcome,
    }))
}
