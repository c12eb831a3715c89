//! Limit evaluation.
//!
//! Limits are advisory unless a tier is explicitly configured to block:
//! everything else over the limit is admitted with a warning.

use crate::models::{LimitAction, Subscription, Tier};
use crate::services::metrics::record_limit_decision;
use crate::services::store::MeteringStore;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::instrument;

/// Usage at or above this percentage of the limit is flagged `warn`.
pub const WARNING_PERCENTAGE: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitDecision {
    Allow,
    Warn,
    Block,
}

impl LimitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitDecision::Allow => "allow",
            LimitDecision::Warn => "warn",
            LimitDecision::Block => "block",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitEvaluation {
    pub allowed: bool,
    pub action: LimitDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// `None` for unlimited tiers.
    pub limit: Option<i64>,
    pub current_usage: i64,
    pub new_total: i64,
    pub percentage: f64,
}

impl LimitEvaluation {
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            action: LimitDecision::Allow,
            reason: None,
            limit: None,
            current_usage: 0,
            new_total: 0,
            percentage: 0.0,
        }
    }
}

/// Decide whether `requested` more units fit the tier, given the usage
/// already recorded this period.
pub fn evaluate(tier: &Tier, current_usage: i64, requested: i64) -> LimitEvaluation {
    let Some(limit) = tier.usage_limit else {
        return LimitEvaluation::unlimited();
    };

    let new_total = current_usage.saturating_add(requested);
    let percentage = new_total as f64 / limit.max(1) as f64 * 100.0;

    let (allowed, action, reason) = if new_total > limit {
        match tier.limit_action() {
            LimitAction::Block => (
                false,
                LimitDecision::Block,
                Some("usage limit reached".to_string()),
            ),
            LimitAction::Overage if tier.overage_allowed => (
                true,
                LimitDecision::Warn,
                Some("overage charges apply".to_string()),
            ),
            _ => (
                true,
                LimitDecision::Warn,
                Some("limit exceeded".to_string()),
            ),
        }
    } else if percentage >= WARNING_PERCENTAGE {
        (true, LimitDecision::Warn, None)
    } else {
        (true, LimitDecision::Allow, None)
    };

    LimitEvaluation {
        allowed,
        action,
        reason,
        limit: Some(limit),
        current_usage,
        new_total,
        percentage,
    }
}

/// Reads the current-period total from the ledger and applies [`evaluate`].
#[derive(Clone)]
pub struct LimitEvaluator {
    store: Arc<dyn MeteringStore>,
}

impl LimitEvaluator {
    pub fn new(store: Arc<dyn MeteringStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, subscription, tier), fields(subscription_id = %subscription.subscription_id))]
    pub async fn check(
        &self,
        subscription: &Subscription,
        tier: &Tier,
        requested: i64,
    ) -> Result<LimitEvaluation, AppError> {
        // Unlimited tiers never touch the ledger.
        if tier.usage_limit.is_none() {
            record_limit_decision(LimitDecision::Allow.as_str());
            return Ok(LimitEvaluation::unlimited());
        }

        let current_usage = self
            .store
            .sum_usage_since(subscription.subscription_id, subscription.current_period_start)
            .await?;

        let evaluation = evaluate(tier, current_usage, requested);
        record_limit_decision(evaluation.action.as_str());

        tracing::debug!(
            current_usage = evaluation.current_usage,
            new_total = evaluation.new_total,
            percentage = evaluation.percentage,
            action = evaluation.action.as_str(),
            "Usage limit evaluated"
        );

        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn tier(limit: Option<i64>, action: &str, overage_allowed: bool) -> Tier {
        Tier {
            tier_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            name: "Test".to_string(),
            usage_limit: limit,
            limit_action: action.to_string(),
            overage_allowed,
            warning_thresholds: vec![80, 90, 95],
            metering_enabled: false,
        }
    }

    #[test]
    fn test_unlimited_tier_always_allows() {
        let result = evaluate(&tier(None, "block", false), 1_000_000, 5);
        assert!(result.allowed);
        assert_eq!(result.action, LimitDecision::Allow);
        assert_eq!(result.limit, None);
    }

    #[test]
    fn test_block_rejects_over_limit_and_accepts_boundary() {
        let t = tier(Some(100), "block", false);

        let over = evaluate(&t, 90, 15);
        assert!(!over.allowed);
        assert_eq!(over.action, LimitDecision::Block);
        assert_eq!(over.new_total, 105);

        let boundary = evaluate(&t, 90, 10);
        assert!(boundary.allowed);
        assert_eq!(boundary.new_total, 100);
        assert_eq!(boundary.action, LimitDecision::Warn);
        assert_eq!(boundary.percentage, 100.0);
    }

    #[test]
    fn test_overage_admits_with_reason() {
        let result = evaluate(&tier(Some(100), "overage", true), 95, 20);
        assert!(result.allowed);
        assert_eq!(result.action, LimitDecision::Warn);
        assert!(result.reason.unwrap().contains("overage"));
    }

    #[test]
    fn test_overage_without_permission_falls_back_to_warn() {
        let result = evaluate(&tier(Some(100), "overage", false), 95, 20);
        assert!(result.allowed);
        assert_eq!(result.reason.as_deref(), Some("limit exceeded"));
    }

    #[test]
    fn test_warn_band_starts_at_eighty_percent() {
        let t = tier(Some(100), "warn", false);
        assert_eq!(evaluate(&t, 0, 79).action, LimitDecision::Allow);
        assert_eq!(evaluate(&t, 0, 80).action, LimitDecision::Warn);
    }

    #[test]
    fn test_zero_limit_stays_finite() {
        let result = evaluate(&tier(Some(0), "block", false), 0, 3);
        assert!(!result.allowed);
        assert_eq!(result.percentage, 300.0);

        let empty = evaluate(&tier(Some(0), "block", false), 0, 0);
        assert!(empty.allowed);
    }
}
