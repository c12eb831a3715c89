//! Error types for metering-service.
//!
//! Everything that maps onto the shared taxonomy goes through [`AppError`];
//! the variants here carry bodies or statuses specific to metering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use thiserror::Error;

/// Machine-readable payload returned with a blocked ingestion.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitExceededDetails {
    pub limit: i64,
    pub current_usage: i64,
    pub requested_quantity: i64,
    pub percentage: f64,
}

#[derive(Debug, Error)]
pub enum MeteringError {
    #[error(transparent)]
    App(#[from] AppError),

    #[error("Usage limit exceeded")]
    LimitExceeded(LimitExceededDetails),

    #[error("Webhook signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("Webhook handler failed: {0}")]
    HandlerProcessing(String),
}

impl From<validator::ValidationErrors> for MeteringError {
    fn from(err: validator::ValidationErrors) -> Self {
        MeteringError::App(AppError::ValidationError(err))
    }
}

impl MeteringError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeteringError::App(err) => err.status_code(),
            MeteringError::LimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            MeteringError::SignatureVerification(_) => StatusCode::BAD_REQUEST,
            MeteringError::HandlerProcessing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MeteringError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            MeteringError::App(err) => err.into_response(),
            MeteringError::LimitExceeded(limits) => (
                status,
                Json(json!({
                    "error": "Usage limit exceeded",
                    "limits": limits,
                })),
            )
                .into_response(),
            MeteringError::SignatureVerification(msg) => (
                status,
                Json(json!({ "error": "Invalid webhook signature", "details": msg })),
            )
                .into_response(),
            MeteringError::HandlerProcessing(msg) => (
                status,
                Json(json!({ "error": "Webhook processing failed", "details": msg })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let blocked = MeteringError::LimitExceeded(LimitExceededDetails {
            limit: 100,
            current_usage: 90,
            requested_quantity: 15,
            percentage: 105.0,
        });
        assert_eq!(blocked.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            MeteringError::SignatureVerification("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            MeteringError::HandlerProcessing("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            MeteringError::from(AppError::NotFound(anyhow::anyhow!("missing"))).status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
