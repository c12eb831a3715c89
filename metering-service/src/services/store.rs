//! Storage seam for the metering pipeline.
//!
//! `Database` is the Postgres implementation; `InMemoryStore` backs tests and
//! local development.

use crate::models::{
    EmailNotification, ListUsageFilter, ListWebhookEventsFilter, MeteringContext, NewLimitEvent,
    NewNotification, NewUsageRecord, Subscription, SubscriptionStateUpdate, UsageLimitEvent,
    UsageRecord, WebhookEvent, WebhookInsert,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait MeteringStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Reference data

    /// Subscription joined with its tier and product.
    async fn get_metering_context(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<MeteringContext>, AppError>;

    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Attach a provider subscription id. Succeeds only if the subscription
    /// is unlinked or already linked to the same id.
    async fn link_stripe_subscription(
        &self,
        subscription_id: Uuid,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError>;

    /// Compare-and-set on `provider_synced_at` for status fields and on
    /// `period_synced_at` for period bounds. Returns `None` without writing
    /// when neither part is newer than what has been applied.
    async fn apply_subscription_state(
        &self,
        subscription_id: Uuid,
        update: &SubscriptionStateUpdate,
    ) -> Result<Option<Subscription>, AppError>;

    async fn record_reported_usage(
        &self,
        subscription_id: Uuid,
        quantity: i64,
        reported_at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    // Usage ledger

    async fn insert_usage_record(&self, input: &NewUsageRecord) -> Result<UsageRecord, AppError>;

    /// Sum of quantities with `timestamp >= since`.
    async fn sum_usage_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError>;

    async fn list_usage_records(
        &self,
        tenant_id: Uuid,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageRecord>, AppError>;

    /// Set `reported_at` if still null. Returns whether a row changed.
    async fn mark_usage_reported(
        &self,
        record_id: Uuid,
        reported_at: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Unreported records for a tenant, oldest first. Only records the
    /// provider can accept: metered tier, linked provider item, not canceled.
    async fn list_unreported_usage(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, AppError>;

    // Threshold events

    async fn threshold_notified(
        &self,
        subscription_id: Uuid,
        threshold: f64,
        period_start: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Insert a limit event and, if given, its outbox notification in one
    /// atomic step. Returns `None` when a notified event for the same
    /// (subscription, threshold, period) already exists.
    async fn record_limit_event(
        &self,
        event: &NewLimitEvent,
        notification: Option<&NewNotification>,
    ) -> Result<Option<UsageLimitEvent>, AppError>;

    async fn list_limit_events(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<UsageLimitEvent>, AppError>;

    // Webhook events

    async fn insert_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookInsert, AppError>;

    /// Take the processing claim on an existing event. Succeeds for `failed`
    /// events and for `pending` ones claimed before `stale_before`; returns
    /// `None` while another delivery holds a live claim or once processed.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError>;

    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError>;

    /// Mark failed, increment `retry_count` and record the error.
    async fn mark_webhook_failed(&self, event_id: &str, error: &str)
        -> Result<WebhookEvent, AppError>;

    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError>;

    // Outbox

    async fn enqueue_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<EmailNotification, AppError>;
}
