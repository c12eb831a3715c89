//! API-key extractor.
//!
//! Accepts the key from `X-API-Key` or an `Authorization: Bearer` header and
//! resolves it through the configured [`ApiKeyVerifier`](crate::services::ApiKeyVerifier).

use crate::services::ApiKeyPrincipal;
use crate::startup::AppState;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use service_core::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Verified caller identity.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth(pub ApiKeyPrincipal);

fn presented_key(parts: &Parts) -> Option<&str> {
    if let Some(key) = parts
        .headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.trim());
    }

    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

#[async_trait]
impl FromRequestParts<AppState> for ApiKeyAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let key = presented_key(parts)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing API key")))?;

        let principal = state.verifier.verify(key).await?.ok_or_else(|| {
            tracing::warn!("Rejected unknown API key");
            AppError::Unauthorized(anyhow::anyhow!("Invalid API key"))
        })?;

        let span = tracing::Span::current();
        span.record("tenant_id", tracing::field::display(principal.tenant_id));
        span.record("key_id", principal.key_id.as_str());

        Ok(ApiKeyAuth(principal))
    }
}
