//! Threshold notifier: one notification per (subscription, threshold,
//! billing period).

use crate::models::{
    LimitEventType, MeteringContext, NewLimitEvent, NewNotification, NotificationType,
    Subscription, UsageLimitEvent,
};
use crate::services::limits::LimitEvaluation;
use crate::services::metrics::record_threshold_event;
use crate::services::store::MeteringStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};

/// Percentage at or above which a crossing is `critical`.
pub const CRITICAL_PERCENTAGE: f64 = 95.0;

/// Threshold (fraction) used for the block path and the implicit 100% mark.
pub const EXCEEDED_THRESHOLD: f64 = 1.0;

/// Highest configured threshold (percent) at or below `percentage`.
///
/// Once usage is past 100% the limit itself counts as a threshold so the
/// `exceeded` notice also fires once per period.
pub fn crossed_threshold(percentage: f64, thresholds: &[i32]) -> Option<i32> {
    let over_limit = percentage > 100.0;
    thresholds
        .iter()
        .copied()
        .chain(over_limit.then_some(100))
        .filter(|t| f64::from(*t) <= percentage)
        .max()
}

pub fn classify(percentage: f64) -> LimitEventType {
    if percentage > 100.0 {
        LimitEventType::Exceeded
    } else if percentage >= CRITICAL_PERCENTAGE {
        LimitEventType::Critical
    } else {
        LimitEventType::Warning
    }
}

fn notification_type(event_type: LimitEventType) -> NotificationType {
    match event_type {
        LimitEventType::Critical => NotificationType::UsageCritical,
        LimitEventType::Exceeded => NotificationType::UsageExceeded,
        _ => NotificationType::UsageWarning,
    }
}

fn usage_notification(
    ctx: &MeteringContext,
    event_type: LimitEventType,
    evaluation: &LimitEvaluation,
) -> NewNotification {
    let limit = evaluation.limit.unwrap_or_default();
    let (subject, body) = match event_type {
        LimitEventType::Exceeded => (
            format!("You have exceeded your {} usage limit", ctx.tier.name),
            format!(
                "Usage for {} is at {} of {} units ({:.0}%).",
                ctx.product.name, evaluation.new_total, limit, evaluation.percentage
            ),
        ),
        _ => (
            format!(
                "You have used {:.0}% of your {} usage limit",
                evaluation.percentage, ctx.tier.name
            ),
            format!(
                "Usage for {} is at {} of {} units.",
                ctx.product.name, evaluation.new_total, limit
            ),
        ),
    };

    NewNotification {
        user_id: ctx.subscription.user_id.clone(),
        notification_type: notification_type(event_type),
        subject,
        body,
        recipient: ctx.subscription.subscriber_email.clone(),
        metadata: Some(json!({
            "subscriptionId": ctx.subscription.subscription_id,
            "currentUsage": evaluation.new_total,
            "usageLimit": evaluation.limit,
            "percentage": evaluation.percentage,
        })),
    }
}

#[derive(Clone)]
pub struct ThresholdNotifier {
    store: Arc<dyn MeteringStore>,
}

impl ThresholdNotifier {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    /// Fire the highest newly crossed threshold for an accepted write, if any.
    #[instrument(skip(self, ctx, evaluation), fields(subscription_id = %ctx.subscription.subscription_id))]
    pub async fn evaluate(
        &self,
        ctx: &MeteringContext,
        evaluation: &LimitEvaluation,
    ) -> Result<Option<UsageLimitEvent>, AppError> {
        if evaluation.limit.is_none() {
            return Ok(None);
        }

        let Some(threshold_pct) = crossed_threshold(evaluation.percentage, &ctx.tier.thresholds())
        else {
            return Ok(None);
        };
        let threshold = f64::from(threshold_pct) / 100.0;
        let period_start = ctx.subscription.current_period_start;

        if self
            .store
            .threshold_notified(ctx.subscription.subscription_id, threshold, period_start)
            .await?
        {
            return Ok(None);
        }

        let event_type = classify(evaluation.percentage);
        let event = NewLimitEvent {
            subscription_id: ctx.subscription.subscription_id,
            user_id: ctx.subscription.user_id.clone(),
            event_type,
            threshold,
            current_usage: evaluation.new_total,
            usage_limit: evaluation.limit,
            percentage: evaluation.percentage,
            notification_sent: true,
            period_start,
        };
        let notification = usage_notification(ctx, event_type, evaluation);

        // A concurrent writer that got there first wins the unique index.
        let recorded = self
            .store
            .record_limit_event(&event, Some(&notification))
            .await?;

        if let Some(recorded) = &recorded {
            record_threshold_event(event_type.as_str());
            info!(
                event_type = event_type.as_str(),
                threshold = threshold,
                percentage = evaluation.percentage,
                "Usage threshold crossed"
            );
            tracing::debug!(event_id = %recorded.event_id, "Threshold event recorded");
        }

        Ok(recorded)
    }

    /// Record a blocked ingestion. Notifies on the first block of the period;
    /// later blocks are kept as audit rows only.
    #[instrument(skip(self, ctx, evaluation), fields(subscription_id = %ctx.subscription.subscription_id))]
    pub async fn record_block(
        &self,
        ctx: &MeteringContext,
        evaluation: &LimitEvaluation,
    ) -> Result<UsageLimitEvent, AppError> {
        let subscription_id = ctx.subscription.subscription_id;
        let period_start = ctx.subscription.current_period_start;

        let mut event = NewLimitEvent {
            subscription_id,
            user_id: ctx.subscription.user_id.clone(),
            event_type: LimitEventType::Exceeded,
            threshold: EXCEEDED_THRESHOLD,
            current_usage: evaluation.current_usage,
            usage_limit: evaluation.limit,
            percentage: evaluation.percentage,
            notification_sent: false,
            period_start,
        };

        let already_notified = self
            .store
            .threshold_notified(subscription_id, EXCEEDED_THRESHOLD, period_start)
            .await?;

        if !already_notified {
            event.notification_sent = true;
            let notification = usage_notification(ctx, LimitEventType::Exceeded, evaluation);
            if let Some(recorded) = self
                .store
                .record_limit_event(&event, Some(&notification))
                .await?
            {
                record_threshold_event(LimitEventType::Exceeded.as_str());
                return Ok(recorded);
            }
            event.notification_sent = false;
        }

        self.store
            .record_limit_event(&event, None)
            .await?
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!("Audit limit event was not recorded"))
            })
    }

    /// Mark the start of a new billing period. Carries no notification.
    #[instrument(skip(self, subscription), fields(subscription_id = %subscription.subscription_id))]
    pub async fn record_period_reset(
        &self,
        subscription: &Subscription,
        usage_limit: Option<i64>,
        period_start: DateTime<Utc>,
    ) -> Result<Option<UsageLimitEvent>, AppError> {
        let event = NewLimitEvent {
            subscription_id: subscription.subscription_id,
            user_id: subscription.user_id.clone(),
            event_type: LimitEventType::Reset,
            threshold: 0.0,
            current_usage: 0,
            usage_limit,
            percentage: 0.0,
            notification_sent: false,
            period_start,
        };
        let recorded = self.store.record_limit_event(&event, None).await?;
        record_threshold_event(LimitEventType::Reset.as_str());
        info!(period_start = %period_start, "Usage period reset");
        Ok(recorded)
    }
}
