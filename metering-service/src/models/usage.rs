//! Usage record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Append-only usage ledger entry. Only `reported_at` ever changes, once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub record_id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
    pub reported_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: String,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Filter parameters for listing usage records. Tenant scoping is applied
/// separately and is not optional.
#[derive(Debug, Clone, Default)]
pub struct ListUsageFilter {
    pub subscription_id: Option<Uuid>,
    pub user_id: Option<String>,
    /// Inclusive.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive.
    pub end: Option<DateTime<Utc>>,
}
