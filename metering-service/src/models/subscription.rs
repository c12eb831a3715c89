//! Subscription model.

use super::{Product, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Trialing,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Trialing => "trialing",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "trialing" => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Map a Stripe subscription status onto the local lifecycle.
    ///
    /// Returns `None` for statuses with no local counterpart (e.g. `paused`),
    /// which leaves the stored status untouched.
    pub fn from_stripe(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" | "unpaid" | "incomplete" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

/// Subscription row. Never deleted, only status-transitioned.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub tier_id: Uuid,
    pub user_id: String,
    pub subscriber_email: Option<String>,
    pub status: String,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at_period_end: bool,
    pub stripe_subscription_id: Option<String>,
    pub stripe_subscription_item_id: Option<String>,
    pub last_reported_usage: Option<i64>,
    pub last_reported_at: Option<DateTime<Utc>>,
    /// Creation time of the newest provider event applied to this row.
    pub provider_synced_at: Option<DateTime<Utc>>,
    /// Creation time of the newest subscription event whose period bounds
    /// were applied. Invoice events do not move it.
    pub period_synced_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Subscription {
    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_string(&self.status)
    }
}

/// Partial state change derived from a provider event. `None` fields are
/// left as stored.
#[derive(Debug, Clone)]
pub struct SubscriptionStateUpdate {
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub stripe_subscription_item_id: Option<String>,
    /// Status, cancel flag and item are applied only if no newer event has
    /// been applied; period bounds only if no newer period has been.
    pub synced_at: DateTime<Utc>,
}

impl SubscriptionStateUpdate {
    pub fn status_only(status: SubscriptionStatus, synced_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: None,
            stripe_subscription_item_id: None,
            synced_at,
        }
    }
}

/// Everything ingestion needs to know about a subscription.
#[derive(Debug, Clone)]
pub struct MeteringContext {
    pub subscription: Subscription,
    pub tier: Tier,
    pub product: Product,
}
