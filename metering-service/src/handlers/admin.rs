//! Operator endpoints.

use crate::middleware::ApiKeyAuth;
use crate::models::{ListWebhookEventsFilter, WebhookEvent, WebhookEventStatus};
use crate::services::{ReconcileSummary, SCOPE_BILLING_ADMIN};
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use service_core::error::AppError;

const MAX_PAGE: i64 = 500;
const DEFAULT_RECONCILE_BATCH: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct WebhookEventsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

fn parse_status(status: &str) -> Result<WebhookEventStatus, AppError> {
    match status {
        "pending" => Ok(WebhookEventStatus::Pending),
        "processed" => Ok(WebhookEventStatus::Processed),
        "failed" => Ok(WebhookEventStatus::Failed),
        other => Err(AppError::BadRequest(anyhow::anyhow!(
            "Unknown webhook event status '{}'",
            other
        ))),
    }
}

/// GET /admin/webhook-events
pub async fn list_webhook_events(
    State(state): State<AppState>,
    ApiKeyAuth(principal): ApiKeyAuth,
    Query(query): Query<WebhookEventsQuery>,
) -> Result<Json<Vec<WebhookEvent>>, AppError> {
    principal.require_scope(SCOPE_BILLING_ADMIN)?;

    let mut filter = ListWebhookEventsFilter::default();
    if let Some(status) = query.status.as_deref() {
        filter.status = Some(parse_status(status)?);
    }
    if let Some(limit) = query.limit {
        filter.limit = limit.clamp(1, MAX_PAGE);
    }

    Ok(Json(state.store.list_webhook_events(&filter).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    pub limit: Option<i64>,
}

/// Replay unreported usage for the caller's tenant.
///
/// POST /admin/usage/reconcile
pub async fn reconcile_usage(
    State(state): State<AppState>,
    ApiKeyAuth(principal): ApiKeyAuth,
    body: Option<Json<ReconcileRequest>>,
) -> Result<Json<ReconcileSummary>, AppError> {
    principal.require_scope(SCOPE_BILLING_ADMIN)?;

    let limit = body
        .and_then(|Json(req)| req.limit)
        .unwrap_or(DEFAULT_RECONCILE_BATCH)
        .clamp(1, MAX_PAGE);

    tracing::info!(tenant_id = %principal.tenant_id, limit, "Reconciling unreported usage");
    let summary = state.reporter.reconcile(principal.tenant_id, limit).await?;

    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("failed").unwrap(), WebhookEventStatus::Failed);
        assert!(parse_status("bogus").is_err());
    }
}
