//! Process-local store.
//!
//! Mirrors the Postgres semantics (idempotent webhook insert, partial-unique
//! threshold dedup, compare-and-set state writes) under one async mutex.
//! Used by the test suite and for running the service without a database.

use crate::models::{
    EmailNotification, ListUsageFilter, ListWebhookEventsFilter, MeteringContext, NewLimitEvent,
    NewNotification, NewUsageRecord, Product, Subscription, SubscriptionStateUpdate,
    SubscriptionStatus, Tier, UsageLimitEvent, UsageRecord, WebhookEvent, WebhookEventStatus,
    WebhookInsert,
};
use crate::services::store::MeteringStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    products: HashMap<Uuid, Product>,
    tiers: HashMap<Uuid, Tier>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage_records: Vec<UsageRecord>,
    limit_events: Vec<UsageLimitEvent>,
    webhook_events: HashMap<String, WebhookEvent>,
    notifications: Vec<EmailNotification>,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_product(&self, product: Product) {
        self.inner
            .lock()
            .await
            .products
            .insert(product.product_id, product);
    }

    pub async fn insert_tier(&self, tier: Tier) {
        self.inner.lock().await.tiers.insert(tier.tier_id, tier);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.inner
            .lock()
            .await
            .subscriptions
            .insert(subscription.subscription_id, subscription);
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Option<Subscription> {
        self.inner
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned()
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.inner.lock().await.usage_records.clone()
    }

    pub async fn notifications(&self) -> Vec<EmailNotification> {
        self.inner.lock().await.notifications.clone()
    }

    pub async fn webhook_event(&self, event_id: &str) -> Option<WebhookEvent> {
        self.inner
            .lock()
            .await
            .webhook_events
            .get(event_id)
            .cloned()
    }
}

fn outbox_row(notification: &NewNotification) -> EmailNotification {
    EmailNotification {
        notification_id: Uuid::new_v4(),
        user_id: notification.user_id.clone(),
        notification_type: notification.notification_type.as_str().to_string(),
        subject: notification.subject.clone(),
        body: notification.body.clone(),
        recipient: notification.recipient.clone(),
        status: "pending".to_string(),
        metadata: notification.metadata.clone(),
        created_utc: Utc::now(),
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{} {} not found", what, id))
}

#[async_trait]
impl MeteringStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_metering_context(
        &self,
        subscription_id: Uuid,
    ) -> Result<Option<MeteringContext>, AppError> {
        let inner = self.inner.lock().await;
        let Some(subscription) = inner.subscriptions.get(&subscription_id) else {
            return Ok(None);
        };
        let tier = inner
            .tiers
            .get(&subscription.tier_id)
            .ok_or_else(|| not_found("tier", subscription.tier_id))?;
        let product = inner
            .products
            .get(&tier.product_id)
            .ok_or_else(|| not_found("product", tier.product_id))?;

        Ok(Some(MeteringContext {
            subscription: subscription.clone(),
            tier: tier.clone(),
            product: product.clone(),
        }))
    }

    async fn find_subscription_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscriptions
            .values()
            .find(|s| s.stripe_subscription_id.as_deref() == Some(stripe_subscription_id))
            .cloned())
    }

    async fn link_stripe_subscription(
        &self,
        subscription_id: Uuid,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(subscription) = inner.subscriptions.get_mut(&subscription_id) else {
            return Ok(None);
        };
        if let Some(existing) = &subscription.stripe_subscription_id {
            if existing != stripe_subscription_id {
                return Ok(None);
            }
        }
        subscription.stripe_subscription_id = Some(stripe_subscription_id.to_string());
        subscription.updated_utc = Utc::now();
        Ok(Some(subscription.clone()))
    }

    async fn apply_subscription_state(
        &self,
        subscription_id: Uuid,
        update: &SubscriptionStateUpdate,
    ) -> Result<Option<Subscription>, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(subscription) = inner.subscriptions.get_mut(&subscription_id) else {
            return Ok(None);
        };
        let state_fresh = subscription
            .provider_synced_at
            .map_or(true, |synced| synced <= update.synced_at);
        let carries_period =
            update.current_period_start.is_some() || update.current_period_end.is_some();
        let period_fresh = carries_period
            && subscription
                .period_synced_at
                .map_or(true, |synced| synced <= update.synced_at);
        if !state_fresh && !period_fresh {
            return Ok(None);
        }

        if state_fresh {
            if let Some(status) = update.status {
                subscription.status = status.as_str().to_string();
            }
            if let Some(cancel) = update.cancel_at_period_end {
                subscription.cancel_at_period_end = cancel;
            }
            if let Some(item) = &update.stripe_subscription_item_id {
                subscription.stripe_subscription_item_id = Some(item.clone());
            }
            subscription.provider_synced_at = Some(update.synced_at);
        }
        if period_fresh {
            if let Some(start) = update.current_period_start {
                subscription.current_period_start = start;
            }
            if let Some(end) = update.current_period_end {
                subscription.current_period_end = end;
            }
            subscription.period_synced_at = Some(update.synced_at);
        }
        subscription.updated_utc = Utc::now();

        Ok(Some(subscription.clone()))
    }

    async fn record_reported_usage(
        &self,
        subscription_id: Uuid,
        quantity: i64,
        reported_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        if let Some(subscription) = inner.subscriptions.get_mut(&subscription_id) {
            let newer = subscription
                .last_reported_at
                .map_or(true, |last| last <= reported_at);
            if newer {
                subscription.last_reported_usage = Some(quantity);
                subscription.last_reported_at = Some(reported_at);
            }
        }
        Ok(())
    }

    async fn insert_usage_record(&self, input: &NewUsageRecord) -> Result<UsageRecord, AppError> {
        let record = UsageRecord {
            record_id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            tenant_id: input.tenant_id,
            user_id: input.user_id.clone(),
            quantity: input.quantity,
            timestamp: input.timestamp,
            metadata: input.metadata.clone(),
            reported_at: None,
            created_utc: Utc::now(),
        };
        self.inner.lock().await.usage_records.push(record.clone());
        Ok(record)
    }

    async fn sum_usage_since(
        &self,
        subscription_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .usage_records
            .iter()
            .filter(|r| r.subscription_id == subscription_id && r.timestamp >= since)
            .map(|r| r.quantity)
            .sum())
    }

    async fn list_usage_records(
        &self,
        tenant_id: Uuid,
        filter: &ListUsageFilter,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<UsageRecord> = inner
            .usage_records
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .filter(|r| filter.subscription_id.map_or(true, |id| r.subscription_id == id))
            .filter(|r| filter.user_id.as_ref().map_or(true, |u| &r.user_id == u))
            .filter(|r| filter.start.map_or(true, |s| r.timestamp >= s))
            .filter(|r| filter.end.map_or(true, |e| r.timestamp <= e))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    async fn mark_usage_reported(
        &self,
        record_id: Uuid,
        reported_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.lock().await;
        match inner
            .usage_records
            .iter_mut()
            .find(|r| r.record_id == record_id && r.reported_at.is_none())
        {
            Some(record) => {
                record.reported_at = Some(reported_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_unreported_usage(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UsageRecord>, AppError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<UsageRecord> = inner
            .usage_records
            .iter()
            .filter(|r| r.tenant_id == tenant_id && r.reported_at.is_none())
            .filter(|r| {
                let Some(subscription) = inner.subscriptions.get(&r.subscription_id) else {
                    return false;
                };
                let metered = inner
                    .tiers
                    .get(&subscription.tier_id)
                    .is_some_and(|t| t.metering_enabled);
                metered
                    && subscription.stripe_subscription_id.is_some()
                    && subscription.stripe_subscription_item_id.is_some()
                    && subscription.status() != SubscriptionStatus::Canceled
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn threshold_notified(
        &self,
        subscription_id: Uuid,
        threshold: f64,
        period_start: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner.limit_events.iter().any(|e| {
            e.subscription_id == subscription_id
                && e.threshold == threshold
                && e.period_start == period_start
                && e.notification_sent
        }))
    }

    async fn record_limit_event(
        &self,
        event: &NewLimitEvent,
        notification: Option<&NewNotification>,
    ) -> Result<Option<UsageLimitEvent>, AppError> {
        let mut inner = self.inner.lock().await;

        if event.notification_sent {
            let duplicate = inner.limit_events.iter().any(|e| {
                e.subscription_id == event.subscription_id
                    && e.threshold == event.threshold
                    && e.period_start == event.period_start
                    && e.notification_sent
            });
            if duplicate {
                return Ok(None);
            }
        }

        let row = UsageLimitEvent {
            event_id: Uuid::new_v4(),
            subscription_id: event.subscription_id,
            user_id: event.user_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            threshold: event.threshold,
            current_usage: event.current_usage,
            usage_limit: event.usage_limit,
            percentage: event.percentage,
            notification_sent: event.notification_sent,
            period_start: event.period_start,
            timestamp: Utc::now(),
        };
        inner.limit_events.push(row.clone());

        if let Some(notification) = notification {
            inner.notifications.push(outbox_row(notification));
        }

        Ok(Some(row))
    }

    async fn list_limit_events(
        &self,
        subscription_id: Uuid,
    ) -> Result<Vec<UsageLimitEvent>, AppError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .limit_events
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn insert_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<WebhookInsert, AppError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.webhook_events.get(event_id) {
            return Ok(WebhookInsert::Existing(existing.clone()));
        }

        let now = Utc::now();
        let event = WebhookEvent {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            status: WebhookEventStatus::Pending.as_str().to_string(),
            retry_count: 0,
            processed_at: None,
            error: None,
            claimed_at: Some(now),
            created_utc: now,
            updated_utc: now,
        };
        inner
            .webhook_events
            .insert(event_id.to_string(), event.clone());
        Ok(WebhookInsert::Inserted(event))
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, AppError> {
        let mut inner = self.inner.lock().await;
        let Some(event) = inner.webhook_events.get_mut(event_id) else {
            return Ok(None);
        };
        let claimable = match event.status() {
            WebhookEventStatus::Failed => true,
            WebhookEventStatus::Pending => event.claimed_at.map_or(true, |at| at < stale_before),
            WebhookEventStatus::Processed => false,
        };
        if !claimable {
            return Ok(None);
        }
        let now = Utc::now();
        event.status = WebhookEventStatus::Pending.as_str().to_string();
        event.claimed_at = Some(now);
        event.updated_utc = now;
        Ok(Some(event.clone()))
    }

    async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| not_found("webhook event", event_id))?;
        let now = Utc::now();
        event.status = WebhookEventStatus::Processed.as_str().to_string();
        event.processed_at = Some(now);
        event.error = None;
        event.updated_utc = now;
        Ok(())
    }

    async fn mark_webhook_failed(
        &self,
        event_id: &str,
        error: &str,
    ) -> Result<WebhookEvent, AppError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| not_found("webhook event", event_id))?;
        event.status = WebhookEventStatus::Failed.as_str().to_string();
        event.retry_count += 1;
        event.error = Some(error.to_string());
        event.updated_utc = Utc::now();
        Ok(event.clone())
    }

    async fn list_webhook_events(
        &self,
        filter: &ListWebhookEventsFilter,
    ) -> Result<Vec<WebhookEvent>, AppError> {
        let inner = self.inner.lock().await;
        let mut events: Vec<WebhookEvent> = inner
            .webhook_events
            .values()
            .filter(|e| filter.status.map_or(true, |s| e.status() == s))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        events.truncate(filter.limit.max(0) as usize);
        Ok(events)
    }

    async fn enqueue_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<EmailNotification, AppError> {
        let row = outbox_row(notification);
        self.inner.lock().await.notifications.push(row.clone());
        Ok(row)
    }
}
