//! Billing-provider webhook endpoint.

use crate::error::MeteringError;
use crate::services::{WebhookAck, SIGNATURE_HEADER};
use crate::startup::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

/// POST /webhooks/billing-provider
pub async fn billing_provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, MeteringError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let ack = state.webhooks.handle(signature, &body).await?;

    Ok(Json(match ack {
        WebhookAck::Processed => json!({ "received": true }),
        WebhookAck::Replayed | WebhookAck::InFlight => {
            json!({ "received": true, "duplicate": true })
        }
        WebhookAck::ReviewRequired => json!({ "received": true, "reviewRequired": true }),
    }))
}
