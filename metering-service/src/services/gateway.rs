//! Usage ingestion gateway.
//!
//! Orchestrates limit evaluation, the ledger write, threshold notification and
//! the two outbound projections (billing provider, product webhook). Local
//! acceptance never depends on the outbound calls.

use crate::error::{LimitExceededDetails, MeteringError};
use crate::models::{MeteringContext, NewUsageRecord, UsageLimitEvent, UsageRecord};
use crate::services::api_keys::{ApiKeyPrincipal, SCOPE_USAGE_WRITE};
use crate::services::limits::{LimitEvaluation, LimitEvaluator};
use crate::services::locks::SubscriptionLocks;
use crate::services::metrics::{record_error, record_usage_accepted};
use crate::services::notifier::ThresholdNotifier;
use crate::services::reporter::BillingReporter;
use crate::services::store::MeteringStore;
use crate::services::usage_webhook::UsageWebhookClient;
use chrono::Utc;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct IngestUsage {
    pub subscription_id: Uuid,
    pub user_id: String,
    pub quantity: i64,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub usage_record: UsageRecord,
    /// Omitted for unlimited tiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitEvaluation>,
    pub stripe_reported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_event: Option<UsageLimitEvent>,
}

#[derive(Clone)]
pub struct UsageGateway {
    store: Arc<dyn MeteringStore>,
    evaluator: LimitEvaluator,
    notifier: ThresholdNotifier,
    reporter: BillingReporter,
    usage_webhook: UsageWebhookClient,
    locks: SubscriptionLocks,
    strict_limit_enforcement: bool,
}

impl UsageGateway {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        reporter: BillingReporter,
        usage_webhook: UsageWebhookClient,
        strict_limit_enforcement: bool,
    ) -> Self {
        Self {
            evaluator: LimitEvaluator::new(store.clone()),
            notifier: ThresholdNotifier::new(store.clone()),
            store,
            reporter,
            usage_webhook,
            locks: SubscriptionLocks::new(),
            strict_limit_enforcement,
        }
    }

    /// Resolve a subscription the caller's tenant owns.
    async fn owned_context(
        &self,
        principal: &ApiKeyPrincipal,
        subscription_id: Uuid,
    ) -> Result<MeteringContext, AppError> {
        let ctx = self
            .store
            .get_metering_context(subscription_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Subscription {} not found", subscription_id))
            })?;

        if ctx.subscription.tenant_id != principal.tenant_id {
            warn!(
                key_id = %principal.key_id,
                key_tenant_id = %principal.tenant_id,
                owner_tenant_id = %ctx.subscription.tenant_id,
                "Cross-tenant usage write rejected"
            );
            record_error("cross_tenant", "ingest_usage");
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "Subscription does not belong to this tenant"
            )));
        }

        Ok(ctx)
    }

    #[instrument(skip(self, principal, input), fields(subscription_id = %input.subscription_id, tenant_id = %principal.tenant_id, quantity = input.quantity))]
    pub async fn ingest(
        &self,
        principal: &ApiKeyPrincipal,
        input: IngestUsage,
    ) -> Result<IngestOutcome, MeteringError> {
        principal.require_scope(SCOPE_USAGE_WRITE)?;

        let ctx = self.owned_context(principal, input.subscription_id).await?;

        let guard = if self.strict_limit_enforcement {
            Some(self.locks.acquire(input.subscription_id).await)
        } else {
            None
        };

        let evaluation = self
            .evaluator
            .check(&ctx.subscription, &ctx.tier, input.quantity)
            .await?;

        if !evaluation.allowed {
            drop(guard);
            if let Err(e) = self.notifier.record_block(&ctx, &evaluation).await {
                warn!(error = %e, "Failed to record limit exceeded event");
            }
            info!(
                current_usage = evaluation.current_usage,
                percentage = evaluation.percentage,
                "Usage rejected by limit"
            );
            return Err(MeteringError::LimitExceeded(LimitExceededDetails {
                limit: evaluation.limit.unwrap_or_default(),
                current_usage: evaluation.current_usage,
                requested_quantity: input.quantity,
                percentage: evaluation.percentage,
            }));
        }

        let usage_record = self
            .store
            .insert_usage_record(&NewUsageRecord {
                subscription_id: input.subscription_id,
                tenant_id: ctx.subscription.tenant_id,
                user_id: input.user_id,
                quantity: input.quantity,
                timestamp: Utc::now(),
                metadata: input.metadata,
            })
            .await?;
        record_usage_accepted(&ctx.subscription.tenant_id.to_string());

        // The record is the source of truth from here on; nothing below may fail the call.
        let threshold_event = match self.notifier.evaluate(&ctx, &evaluation).await {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Threshold evaluation failed");
                record_error("threshold", "ingest_usage");
                None
            }
        };
        drop(guard);

        let (report, _) = tokio::join!(
            self.reporter.report(&ctx, &usage_record),
            self.post_usage_webhook(&ctx, &usage_record)
        );

        info!(
            record_id = %usage_record.record_id,
            action = evaluation.action.as_str(),
            stripe_reported = report.is_reported(),
            "Usage recorded"
        );

        Ok(IngestOutcome {
            usage_record,
            limits: evaluation.limit.is_some().then_some(evaluation),
            stripe_reported: report.is_reported(),
            threshold_event,
        })
    }

    async fn post_usage_webhook(&self, ctx: &MeteringContext, record: &UsageRecord) {
        let Some(url) = ctx.product.usage_webhook_url.as_deref() else {
            return;
        };
        if let Err(e) = self.usage_webhook.send(url, record).await {
            warn!(
                product_id = %ctx.product.product_id,
                error = %e,
                "Usage webhook delivery failed"
            );
            record_error("usage_webhook", "ingest_usage");
        }
    }
}
