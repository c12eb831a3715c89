//! Email notification outbox rows.
//!
//! Rows are written here and drained by a separate delivery worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    UsageWarning,
    UsageCritical,
    UsageExceeded,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentSucceeded,
    PaymentFailed,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::UsageWarning => "usage_warning",
            NotificationType::UsageCritical => "usage_critical",
            NotificationType::UsageExceeded => "usage_exceeded",
            NotificationType::SubscriptionCreated => "subscription_created",
            NotificationType::SubscriptionUpdated => "subscription_updated",
            NotificationType::SubscriptionCanceled => "subscription_canceled",
            NotificationType::PaymentSucceeded => "payment_succeeded",
            NotificationType::PaymentFailed => "payment_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EmailNotification {
    pub notification_id: Uuid,
    pub user_id: String,
    pub notification_type: String,
    pub subject: String,
    pub body: String,
    pub recipient: Option<String>,
    pub status: String,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: String,
    pub notification_type: NotificationType,
    pub subject: String,
    pub body: String,
    pub recipient: Option<String>,
    pub metadata: Option<serde_json::Value>,
}
