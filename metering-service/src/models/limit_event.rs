//! Usage limit (threshold) events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitEventType {
    Warning,
    Critical,
    Exceeded,
    Reset,
}

impl LimitEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitEventType::Warning => "warning",
            LimitEventType::Critical => "critical",
            LimitEventType::Exceeded => "exceeded",
            LimitEventType::Reset => "reset",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "critical" => LimitEventType::Critical,
            "exceeded" => LimitEventType::Exceeded,
            "reset" => LimitEventType::Reset,
            _ => LimitEventType::Warning,
        }
    }
}

/// Threshold event. At most one row per (subscription, threshold,
/// period_start) has `notification_sent = true`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitEvent {
    pub event_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: String,
    pub event_type: String,
    /// Fraction of the limit, 0..=1.
    pub threshold: f64,
    pub current_usage: i64,
    pub usage_limit: Option<i64>,
    pub percentage: f64,
    pub notification_sent: bool,
    pub period_start: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl UsageLimitEvent {
    pub fn event_type(&self) -> LimitEventType {
        LimitEventType::from_string(&self.event_type)
    }
}

#[derive(Debug, Clone)]
pub struct NewLimitEvent {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub event_type: LimitEventType,
    pub threshold: f64,
    pub current_usage: i64,
    pub usage_limit: Option<i64>,
    pub percentage: f64,
    pub notification_sent: bool,
    pub period_start: DateTime<Utc>,
}
