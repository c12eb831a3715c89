//! Usage ingestion and query endpoints.

use crate::error::MeteringError;
use crate::middleware::ApiKeyAuth;
use crate::models::{ListUsageFilter, UsageRecord};
use crate::services::{IngestOutcome, IngestUsage, SCOPE_USAGE_READ};
use crate::startup::AppState;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RecordUsageRequest {
    pub subscription_id: Uuid,
    #[validate(length(min = 1, message = "userId must not be empty"))]
    pub user_id: String,
    #[validate(range(min = 0, message = "quantity must be non-negative"))]
    pub quantity: i64,
    pub metadata: Option<serde_json::Value>,
}

/// Record a usage event.
///
/// POST /usage
pub async fn record_usage(
    State(state): State<AppState>,
    ApiKeyAuth(principal): ApiKeyAuth,
    payload: Result<Json<RecordUsageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestOutcome>), MeteringError> {
    let Json(req) = payload.map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;
    req.validate()?;

    let outcome = state
        .gateway
        .ingest(
            &principal,
            IngestUsage {
                subscription_id: req.subscription_id,
                user_id: req.user_id,
                quantity: req.quantity,
                metadata: req.metadata,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageQuery {
    pub subscription_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageQueryResponse {
    pub total_usage: i64,
    pub record_count: usize,
    pub records: Vec<UsageRecord>,
}

/// List usage records owned by the caller's tenant.
///
/// GET /usage
pub async fn query_usage(
    State(state): State<AppState>,
    ApiKeyAuth(principal): ApiKeyAuth,
    query: Result<Query<UsageQuery>, axum::extract::rejection::QueryRejection>,
) -> Result<Json<UsageQueryResponse>, AppError> {
    principal.require_scope(SCOPE_USAGE_READ)?;
    let Query(query) = query.map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;

    if let (Some(start), Some(end)) = (query.start_date, query.end_date) {
        if start > end {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "startDate must not be after endDate"
            )));
        }
    }

    let filter = ListUsageFilter {
        subscription_id: query.subscription_id,
        user_id: query.user_id,
        start: query.start_date,
        end: query.end_date,
    };
    let records = state
        .store
        .list_usage_records(principal.tenant_id, &filter)
        .await?;

    Ok(Json(UsageQueryResponse {
        total_usage: records.iter().map(|r| r.quantity).sum(),
        record_count: records.len(),
        records,
    }))
}
