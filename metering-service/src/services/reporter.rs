//! Billing reporter: forwards accepted usage to the metered-billing provider.
//!
//! Reporting is a best-effort projection of the local ledger. Nothing here
//! fails an ingestion; records that could not be reported keep
//! `reported_at = NULL` and are picked up by [`BillingReporter::reconcile`].

use crate::models::{MeteringContext, SubscriptionStatus, UsageRecord};
use crate::services::metrics::{record_error, record_provider_report};
use crate::services::store::MeteringStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use service_core::error::AppError;
use service_core::http::Retryable;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Billing provider not configured")]
    NotConfigured,

    #[error("Provider request timed out: {0}")]
    Timeout(String),

    #[error("Provider unreachable: {0}")]
    Network(String),

    #[error("Provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Provider error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_) | ProviderError::Network(_) | ProviderError::Upstream { .. }
        )
    }
}

/// Usage record as acknowledged by the provider.
#[derive(Debug, Clone)]
pub struct ProviderUsageRecord {
    pub id: String,
    pub quantity: i64,
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Add `quantity` to the metered item. `idempotency_key` must be stable
    /// per local usage record so replays never double-count.
    async fn report_usage(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<ProviderUsageRecord, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ProviderNotConfigured,
    MeteringDisabled,
    NoProviderSubscription,
    SubscriptionCanceled,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ProviderNotConfigured => "provider_not_configured",
            SkipReason::MeteringDisabled => "metering_disabled",
            SkipReason::NoProviderSubscription => "no_provider_subscription",
            SkipReason::SubscriptionCanceled => "subscription_canceled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported { provider_record_id: String },
    Skipped(SkipReason),
    Failed(String),
}

impl ReportOutcome {
    pub fn is_reported(&self) -> bool {
        matches!(self, ReportOutcome::Reported { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub examined: usize,
    pub reported: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub fn idempotency_key(record_id: Uuid) -> String {
    format!("usage-{}", record_id)
}

#[derive(Clone)]
pub struct BillingReporter {
    store: Arc<dyn MeteringStore>,
    provider: Arc<dyn BillingProvider>,
}

impl BillingReporter {
    pub fn new(store: Arc<dyn MeteringStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { store, provider }
    }

    fn skip_reason(&self, ctx: &MeteringContext) -> Option<SkipReason> {
        if !self.provider.is_configured() {
            return Some(SkipReason::ProviderNotConfigured);
        }
        if !ctx.tier.metering_enabled {
            return Some(SkipReason::MeteringDisabled);
        }
        if ctx.subscription.stripe_subscription_id.is_none()
            || ctx.subscription.stripe_subscription_item_id.is_none()
        {
            return Some(SkipReason::NoProviderSubscription);
        }
        if ctx.subscription.status() == SubscriptionStatus::Canceled {
            return Some(SkipReason::SubscriptionCanceled);
        }
        None
    }

    /// Report one record. Never returns an error: failures are logged and
    /// reflected in the outcome.
    #[instrument(skip(self, ctx, record), fields(subscription_id = %record.subscription_id, record_id = %record.record_id))]
    pub async fn report(&self, ctx: &MeteringContext, record: &UsageRecord) -> ReportOutcome {
        if let Some(reason) = self.skip_reason(ctx) {
            tracing::debug!(reason = reason.as_str(), "Usage reporting skipped");
            record_provider_report("skipped");
            return ReportOutcome::Skipped(reason);
        }

        let Some(item_id) = ctx.subscription.stripe_subscription_item_id.as_deref() else {
            return ReportOutcome::Skipped(SkipReason::NoProviderSubscription);
        };

        let reported = match self
            .provider
            .report_usage(
                item_id,
                record.quantity,
                record.timestamp,
                &idempotency_key(record.record_id),
            )
            .await
        {
            Ok(reported) => reported,
            Err(e) => {
                warn!(error = %e, "Failed to report usage to billing provider");
                record_provider_report("failed");
                record_error("provider_report", "report_usage");
                return ReportOutcome::Failed(e.to_string());
            }
        };

        let now = Utc::now();
        // The provider has the usage at this point; bookkeeping failures only
        // mean reconciliation may resend it under the same idempotency key.
        if let Err(e) = self.store.mark_usage_reported(record.record_id, now).await {
            warn!(error = %e, "Failed to mark usage record reported");
        }
        if let Err(e) = self
            .store
            .record_reported_usage(record.subscription_id, record.quantity, now)
            .await
        {
            warn!(error = %e, "Failed to update last reported usage");
        }

        record_provider_report("reported");
        info!(
            provider_record_id = %reported.id,
            quantity = reported.quantity,
            "Usage reported to billing provider"
        );

        ReportOutcome::Reported {
            provider_record_id: reported.id,
        }
    }

    /// Replay unreported records for a tenant, oldest first.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn reconcile(&self, tenant_id: Uuid, limit: i64) -> Result<ReconcileSummary, AppError> {
        let records = self.store.list_unreported_usage(tenant_id, limit).await?;
        let mut contexts: HashMap<Uuid, Option<MeteringContext>> = HashMap::new();
        let mut summary = ReconcileSummary {
            examined: records.len(),
            ..Default::default()
        };

        for record in &records {
            if !contexts.contains_key(&record.subscription_id) {
                let ctx = self.store.get_metering_context(record.subscription_id).await?;
                contexts.insert(record.subscription_id, ctx);
            }
            let Some(Some(ctx)) = contexts.get(&record.subscription_id) else {
                summary.skipped += 1;
                continue;
            };

            match self.report(ctx, record).await {
                ReportOutcome::Reported { .. } => summary.reported += 1,
                ReportOutcome::Skipped(_) => summary.skipped += 1,
                ReportOutcome::Failed(_) => summary.failed += 1,
            }
        }

        info!(
            examined = summary.examined,
            reported = summary.reported,
            skipped = summary.skipped,
            failed = summary.failed,
            "Usage reconciliation finished"
        );

        Ok(summary)
    }
}
