//! Inbound billing-provider webhook events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `pending -> processed` or `pending -> failed`. `pending` means a delivery
/// holds the claim; a failed event, or a pending one whose claim has gone
/// stale, may be claimed again on redelivery until its retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Pending,
    Processed,
    Failed,
}

impl WebhookEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEventStatus::Pending => "pending",
            WebhookEventStatus::Processed => "processed",
            WebhookEventStatus::Failed => "failed",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "processed" => WebhookEventStatus::Processed,
            "failed" => WebhookEventStatus::Failed,
            _ => WebhookEventStatus::Pending,
        }
    }
}

/// Persisted provider event, keyed by the provider's event id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// When the current or last delivery claimed the event for processing.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn status(&self) -> WebhookEventStatus {
        WebhookEventStatus::from_string(&self.status)
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone)]
pub enum WebhookInsert {
    Inserted(WebhookEvent),
    Existing(WebhookEvent),
}

#[derive(Debug, Clone)]
pub struct ListWebhookEventsFilter {
    pub status: Option<WebhookEventStatus>,
    pub limit: i64,
}

impl Default for ListWebhookEventsFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
        }
    }
}
