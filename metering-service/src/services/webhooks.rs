//! Billing-provider webhook processing.
//!
//! Events are verified, persisted under the provider's event id, then
//! dispatched through an exhaustive match on [`BillingEvent`]. Each handler is
//! safe to re-run: state writes are compare-and-set on the provider event
//! time, so a redelivered or reordered event never overwrites newer state.

use crate::error::MeteringError;
use crate::models::{
    NewNotification, NotificationType, Subscription, SubscriptionStateUpdate, SubscriptionStatus,
    WebhookEvent, WebhookEventStatus, WebhookInsert,
};
use crate::services::metrics::{record_error, record_webhook_event};
use crate::services::notifier::ThresholdNotifier;
use crate::services::store::MeteringStore;
use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::signature::verify_hmac_sha256_hex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Metadata key the checkout flow sets to the local subscription id.
const SUBSCRIPTION_METADATA_KEY: &str = "subscription_id";

// =========================================================================
// Signature verification
// =========================================================================

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("malformed signature header")]
    Malformed,
    #[error("timestamp outside tolerance")]
    Expired,
    #[error("no matching signature")]
    Mismatch,
}

struct SignatureParts<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_signature_header(header: &str) -> Result<SignatureParts<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(SignatureParts {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::Malformed),
    }
}

/// Verify a `t=<unix>,v1=<hex>` header against `HMAC-SHA256(secret, "{t}.{payload}")`.
pub fn verify_signature(
    secret: &str,
    header: Option<&str>,
    payload: &[u8],
    tolerance: Duration,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let parts = parse_signature_header(header)?;

    if (now - parts.timestamp).unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mut signed = format!("{}.", parts.timestamp).into_bytes();
    signed.extend_from_slice(payload);

    let matched = parts.signatures.iter().any(|candidate| {
        verify_hmac_sha256_hex(secret.as_bytes(), &signed, candidate).unwrap_or(false)
    });

    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

// =========================================================================
// Event model
// =========================================================================

/// Provider event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: ProviderEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub items: Option<StripeList<StripeSubscriptionItem>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: String,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub price: Option<StripePrice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub recurring: Option<StripeRecurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeRecurring {
    pub usage_type: Option<String>,
}

impl StripeSubscriptionItem {
    fn is_metered(&self) -> bool {
        self.price
            .as_ref()
            .and_then(|p| p.recurring.as_ref())
            .and_then(|r| r.usage_type.as_deref())
            == Some("metered")
    }
}

impl StripeSubscription {
    fn items(&self) -> &[StripeSubscriptionItem] {
        self.items.as_ref().map(|l| l.data.as_slice()).unwrap_or(&[])
    }

    /// The metered line item usage is reported against. A lone item without
    /// price details is taken as the metered one.
    pub fn metered_item(&self) -> Option<&StripeSubscriptionItem> {
        let items = self.items();
        items
            .iter()
            .find(|i| i.is_metered())
            .or_else(|| match items {
                [only] if only.price.is_none() => Some(only),
                _ => None,
            })
    }

    /// Period bounds; newer API versions carry them on the items only.
    pub fn period(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let first = self.items().first();
        let start = self
            .current_period_start
            .or_else(|| first.and_then(|i| i.current_period_start));
        let end = self
            .current_period_end
            .or_else(|| first.and_then(|i| i.current_period_end));
        (start.and_then(from_unix), end.and_then(from_unix))
    }

    pub fn local_subscription_id(&self) -> Option<Uuid> {
        self.metadata
            .get(SUBSCRIPTION_METADATA_KEY)
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub id: String,
    pub subscription: Option<String>,
    pub amount_paid: Option<i64>,
    pub amount_due: Option<i64>,
    pub currency: Option<String>,
}

/// Every provider event type this service acts on. Anything else is
/// persisted and acknowledged as `Unsupported`.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    SubscriptionCreated(StripeSubscription),
    SubscriptionUpdated(StripeSubscription),
    SubscriptionDeleted(StripeSubscription),
    PaymentSucceeded(StripeInvoice),
    PaymentFailed(StripeInvoice),
    Unsupported(String),
}

impl BillingEvent {
    pub fn from_provider(event: &ProviderEvent) -> Result<Self, serde_json::Error> {
        let object = || event.data.object.clone();
        Ok(match event.event_type.as_str() {
            "customer.subscription.created" => {
                BillingEvent::SubscriptionCreated(serde_json::from_value(object())?)
            }
            "customer.subscription.updated" => {
                BillingEvent::SubscriptionUpdated(serde_json::from_value(object())?)
            }
            "customer.subscription.deleted" => {
                BillingEvent::SubscriptionDeleted(serde_json::from_value(object())?)
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                BillingEvent::PaymentSucceeded(serde_json::from_value(object())?)
            }
            "invoice.payment_failed" => {
                BillingEvent::PaymentFailed(serde_json::from_value(object())?)
            }
            other => BillingEvent::Unsupported(other.to_string()),
        })
    }
}

fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0).single()
}

// =========================================================================
// Processor
// =========================================================================

/// How a delivery was acknowledged. Every variant answers 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Processed,
    /// Already processed; side effects not re-applied.
    Replayed,
    /// Retry budget spent; left `failed` for operator review.
    ReviewRequired,
    /// Another delivery holds a live claim on the event.
    InFlight,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    store: Arc<dyn MeteringStore>,
    notifier: ThresholdNotifier,
    signing_secret: Secret<String>,
    signature_tolerance: Duration,
    max_retries: i32,
    claim_timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        signing_secret: Secret<String>,
        signature_tolerance: Duration,
        max_retries: i32,
        claim_timeout: Duration,
    ) -> Self {
        Self {
            notifier: ThresholdNotifier::new(store.clone()),
            store,
            signing_secret,
            signature_tolerance,
            max_retries,
            claim_timeout,
        }
    }

    #[instrument(skip(self, signature, payload), fields(event_id))]
    pub async fn handle(
        &self,
        signature: Option<&str>,
        payload: &[u8],
    ) -> Result<WebhookAck, MeteringError> {
        verify_signature(
            self.signing_secret.expose_secret(),
            signature,
            payload,
            self.signature_tolerance,
            Utc::now().timestamp(),
        )
        .map_err(|e| {
            warn!(error = %e, "Webhook signature verification failed");
            record_error("signature", "webhook");
            MeteringError::SignatureVerification(e.to_string())
        })?;

        let raw: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Malformed webhook payload: {}", e))
        })?;
        let event: ProviderEvent = serde_json::from_value(raw.clone()).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("Malformed webhook event: {}", e))
        })?;

        tracing::Span::current().record("event_id", event.id.as_str());

        let stored = match self
            .store
            .insert_webhook_event(&event.id, &event.event_type, &raw)
            .await?
        {
            WebhookInsert::Inserted(stored) => stored,
            WebhookInsert::Existing(existing) => {
                if let Some(ack) = self.redelivery_ack(&existing) {
                    record_webhook_event(&event.event_type, "duplicate");
                    return Ok(ack);
                }
                let stale_before = Utc::now()
                    - chrono::Duration::from_std(self.claim_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                let Some(claimed) = self
                    .store
                    .claim_webhook_event(&event.id, stale_before)
                    .await?
                else {
                    info!(event_id = %event.id, "Webhook event is being processed by another delivery");
                    record_webhook_event(&event.event_type, "in_flight");
                    return Ok(WebhookAck::InFlight);
                };
                info!(
                    event_id = %event.id,
                    retry_count = claimed.retry_count,
                    "Reprocessing redelivered webhook event"
                );
                claimed
            }
        };

        match self.dispatch(&event).await {
            Ok(()) => {
                self.store.mark_webhook_processed(&stored.event_id).await?;
                record_webhook_event(&event.event_type, "processed");
                info!(event_id = %event.id, event_type = %event.event_type, "Webhook event processed");
                Ok(WebhookAck::Processed)
            }
            Err(e) => {
                let message = e.to_string();
                let failed = self
                    .store
                    .mark_webhook_failed(&stored.event_id, &message)
                    .await?;
                record_webhook_event(&event.event_type, "failed");
                warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    retry_count = failed.retry_count,
                    error = %message,
                    "Webhook event handler failed"
                );
                Err(MeteringError::HandlerProcessing(message))
            }
        }
    }

    /// `Some` when a redelivery should be acknowledged without reprocessing.
    fn redelivery_ack(&self, existing: &WebhookEvent) -> Option<WebhookAck> {
        match existing.status() {
            WebhookEventStatus::Processed => Some(WebhookAck::Replayed),
            WebhookEventStatus::Failed if existing.retry_count >= self.max_retries => {
                warn!(
                    event_id = %existing.event_id,
                    retry_count = existing.retry_count,
                    "Webhook event exceeded retry budget; awaiting operator review"
                );
                Some(WebhookAck::ReviewRequired)
            }
            _ => None,
        }
    }

    async fn dispatch(&self, event: &ProviderEvent) -> Result<(), AppError> {
        let synced_at = from_unix(event.created).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Invalid event timestamp {}", event.created))
        })?;
        let billing_event = BillingEvent::from_provider(event).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!(
                "Malformed {} object: {}",
                event.event_type,
                e
            ))
        })?;

        match billing_event {
            BillingEvent::SubscriptionCreated(sub) => {
                self.on_subscription_changed(&sub, synced_at, true).await
            }
            BillingEvent::SubscriptionUpdated(sub) => {
                self.on_subscription_changed(&sub, synced_at, false).await
            }
            BillingEvent::SubscriptionDeleted(sub) => {
                self.on_subscription_deleted(&sub, synced_at).await
            }
            BillingEvent::PaymentSucceeded(invoice) => {
                self.on_payment_succeeded(&invoice, synced_at).await
            }
            BillingEvent::PaymentFailed(invoice) => {
                self.on_payment_failed(&invoice, synced_at).await
            }
            BillingEvent::Unsupported(event_type) => {
                tracing::debug!(event_type = %event_type, "Ignoring unsupported webhook event");
                Ok(())
            }
        }
    }

    /// Local subscription for a provider subscription, linking it through
    /// checkout metadata on first sight.
    async fn resolve_subscription(
        &self,
        stripe_subscription_id: &str,
        local_hint: Option<Uuid>,
    ) -> Result<Subscription, AppError> {
        if let Some(found) = self
            .store
            .find_subscription_by_stripe_id(stripe_subscription_id)
            .await?
        {
            return Ok(found);
        }

        if let Some(local_id) = local_hint {
            if let Some(linked) = self
                .store
                .link_stripe_subscription(local_id, stripe_subscription_id)
                .await?
            {
                info!(
                    subscription_id = %local_id,
                    stripe_subscription_id = %stripe_subscription_id,
                    "Linked provider subscription"
                );
                return Ok(linked);
            }
        }

        Err(AppError::NotFound(anyhow::anyhow!(
            "No local subscription for provider subscription {}",
            stripe_subscription_id
        )))
    }

    async fn on_subscription_changed(
        &self,
        sub: &StripeSubscription,
        synced_at: DateTime<Utc>,
        created: bool,
    ) -> Result<(), AppError> {
        let before = self
            .resolve_subscription(&sub.id, sub.local_subscription_id())
            .await?;
        let (period_start, period_end) = sub.period();

        let update = SubscriptionStateUpdate {
            status: SubscriptionStatus::from_stripe(&sub.status),
            current_period_start: period_start,
            current_period_end: period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            stripe_subscription_item_id: sub.metered_item().map(|i| i.id.clone()),
            synced_at,
        };

        let Some(after) = self
            .store
            .apply_subscription_state(before.subscription_id, &update)
            .await?
        else {
            info!(
                subscription_id = %before.subscription_id,
                "Stale subscription event ignored"
            );
            return Ok(());
        };

        if after.current_period_start > before.current_period_start {
            let usage_limit = self
                .store
                .get_metering_context(after.subscription_id)
                .await?
                .and_then(|ctx| ctx.tier.usage_limit);
            self.notifier
                .record_period_reset(&after, usage_limit, after.current_period_start)
                .await?;
        }

        if created {
            self.notify(
                &after,
                NotificationType::SubscriptionCreated,
                "Your subscription is active".to_string(),
                format!("Subscription status: {}.", after.status),
            )
            .await?;
        } else if after.status != before.status
            || after.cancel_at_period_end != before.cancel_at_period_end
        {
            let body = if after.cancel_at_period_end {
                format!(
                    "Your subscription will end on {}.",
                    after.current_period_end.format("%Y-%m-%d")
                )
            } else {
                format!("Subscription status changed to {}.", after.status)
            };
            self.notify(
                &after,
                NotificationType::SubscriptionUpdated,
                "Your subscription has changed".to_string(),
                body,
            )
            .await?;
        }

        Ok(())
    }

    async fn on_subscription_deleted(
        &self,
        sub: &StripeSubscription,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let before = self
            .resolve_subscription(&sub.id, sub.local_subscription_id())
            .await?;

        let update = SubscriptionStateUpdate::status_only(SubscriptionStatus::Canceled, synced_at);
        let Some(after) = self
            .store
            .apply_subscription_state(before.subscription_id, &update)
            .await?
        else {
            return Ok(());
        };

        if before.status() != SubscriptionStatus::Canceled {
            self.notify(
                &after,
                NotificationType::SubscriptionCanceled,
                "Your subscription has been canceled".to_string(),
                "Your subscription has ended. Usage is no longer billed.".to_string(),
            )
            .await?;
        }

        Ok(())
    }

    async fn on_payment_succeeded(
        &self,
        invoice: &StripeInvoice,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(stripe_subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice without subscription ignored");
            return Ok(());
        };
        let subscription = self.resolve_subscription(stripe_subscription_id, None).await?;

        if subscription.status() == SubscriptionStatus::PastDue {
            let update =
                SubscriptionStateUpdate::status_only(SubscriptionStatus::Active, synced_at);
            if self
                .store
                .apply_subscription_state(subscription.subscription_id, &update)
                .await?
                .is_some()
            {
                info!(subscription_id = %subscription.subscription_id, "Subscription reactivated after payment");
            }
        }

        self.notify(
            &subscription,
            NotificationType::PaymentSucceeded,
            "Payment received".to_string(),
            format!(
                "We received your payment of {}.",
                format_amount(invoice.amount_paid, invoice.currency.as_deref())
            ),
        )
        .await
    }

    async fn on_payment_failed(
        &self,
        invoice: &StripeInvoice,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let Some(stripe_subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice without subscription ignored");
            return Ok(());
        };
        let subscription = self.resolve_subscription(stripe_subscription_id, None).await?;

        let update = SubscriptionStateUpdate::status_only(SubscriptionStatus::PastDue, synced_at);
        if self
            .store
            .apply_subscription_state(subscription.subscription_id, &update)
            .await?
            .is_none()
        {
            info!(subscription_id = %subscription.subscription_id, "Stale payment failure ignored");
            return Ok(());
        }

        self.notify(
            &subscription,
            NotificationType::PaymentFailed,
            "Payment failed".to_string(),
            format!(
                "We could not collect your payment of {}. Please update your payment method.",
                format_amount(invoice.amount_due, invoice.currency.as_deref())
            ),
        )
        .await
    }

    async fn notify(
        &self,
        subscription: &Subscription,
        notification_type: NotificationType,
        subject: String,
        body: String,
    ) -> Result<(), AppError> {
        self.store
            .enqueue_notification(&NewNotification {
                user_id: subscription.user_id.clone(),
                notification_type,
                subject,
                body,
                recipient: subscription.subscriber_email.clone(),
                metadata: Some(json!({
                    "subscriptionId": subscription.subscription_id,
                    "status": subscription.status,
                })),
            })
            .await?;
        Ok(())
    }
}

fn format_amount(amount: Option<i64>, currency: Option<&str>) -> String {
    let minor = amount.unwrap_or_default();
    let currency = currency.unwrap_or("usd").to_uppercase();
    format!("{}.{:02} {}", minor / 100, (minor % 100).abs(), currency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::utils::signature::compute_hmac_sha256_hex;

    const SECRET: &str = "whsec_test";
    const TOLERANCE: Duration = Duration::from_secs(300);

    fn sign(payload: &[u8], ts: i64) -> String {
        let mut signed = format!("{}.", ts).into_bytes();
        signed.extend_from_slice(payload);
        format!(
            "t={},v1={}",
            ts,
            compute_hmac_sha256_hex(SECRET.as_bytes(), &signed).unwrap()
        )
    }

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        assert_eq!(
            verify_signature(SECRET, Some(&header), payload, TOLERANCE, 1_700_000_010),
            Ok(())
        );
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let payload = br#"{"id":"evt_1"}"#;
        let good = sign(payload, 1_700_000_000);
        let header = format!("t=1700000000,v1=deadbeef,{}", &good[13..]);
        assert_eq!(
            verify_signature(SECRET, Some(&header), payload, TOLERANCE, 1_700_000_000),
            Ok(())
        );
    }

    #[test]
    fn test_signature_failures() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);

        assert_eq!(
            verify_signature(SECRET, None, payload, TOLERANCE, 1_700_000_000),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_signature(SECRET, Some("garbage"), payload, TOLERANCE, 1_700_000_000),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, Some(&header), payload, TOLERANCE, 1_700_001_000),
            Err(SignatureError::Expired)
        );
        assert_eq!(
            verify_signature(
                SECRET,
                Some(&header),
                br#"{"id":"evt_2"}"#,
                TOLERANCE,
                1_700_000_000
            ),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature("other", Some(&header), payload, TOLERANCE, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_event_type_mapping() {
        let event = |event_type: &str, object: serde_json::Value| ProviderEvent {
            id: "evt".to_string(),
            event_type: event_type.to_string(),
            created: 0,
            data: ProviderEventData { object },
        };
        let sub = json!({ "id": "sub_1", "status": "active" });
        let invoice = json!({ "id": "in_1", "subscription": "sub_1" });

        assert!(matches!(
            BillingEvent::from_provider(&event("customer.subscription.updated", sub)).unwrap(),
            BillingEvent::SubscriptionUpdated(_)
        ));
        assert!(matches!(
            BillingEvent::from_provider(&event("invoice.paid", invoice.clone())).unwrap(),
            BillingEvent::PaymentSucceeded(_)
        ));
        assert!(matches!(
            BillingEvent::from_provider(&event("invoice.payment_failed", invoice)).unwrap(),
            BillingEvent::PaymentFailed(_)
        ));
        assert!(matches!(
            BillingEvent::from_provider(&event("charge.refunded", json!({}))).unwrap(),
            BillingEvent::Unsupported(_)
        ));
        assert!(
            BillingEvent::from_provider(&event("customer.subscription.created", json!({})))
                .is_err()
        );
    }

    #[test]
    fn test_metered_item_and_period_fallback() {
        let sub: StripeSubscription = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "items": { "data": [
                { "id": "si_flat", "current_period_start": 1_700_000_000, "current_period_end": 1_702_592_000,
                  "price": { "recurring": { "usage_type": "licensed" } } },
                { "id": "si_metered", "price": { "recurring": { "usage_type": "metered" } } }
            ]}
        }))
        .unwrap();

        assert_eq!(sub.metered_item().map(|i| i.id.as_str()), Some("si_metered"));
        let (start, end) = sub.period();
        assert_eq!(start.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(end.unwrap().timestamp(), 1_702_592_000);
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(Some(2599), Some("usd")), "25.99 USD");
        assert_eq!(format_amount(None, None), "0.00 USD");
    }
}
