//! Tier and product reference data.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Thresholds (percent of limit) used when a tier does not configure its own.
pub const DEFAULT_WARNING_THRESHOLDS: [i32; 3] = [80, 90, 95];

/// What happens when a request would push usage past the tier limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    Allow,
    Warn,
    Block,
    Overage,
}

impl LimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitAction::Allow => "allow",
            LimitAction::Warn => "warn",
            LimitAction::Block => "block",
            LimitAction::Overage => "overage",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "allow" => LimitAction::Allow,
            "block" => LimitAction::Block,
            "overage" => LimitAction::Overage,
            _ => LimitAction::Warn,
        }
    }
}

/// Tier reference data. Read-only to this service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tier {
    pub tier_id: Uuid,
    pub product_id: Uuid,
    pub name: String,
    /// `None` means unlimited.
    pub usage_limit: Option<i64>,
    pub limit_action: String,
    pub overage_allowed: bool,
    pub warning_thresholds: Vec<i32>,
    pub metering_enabled: bool,
}

impl Tier {
    pub fn limit_action(&self) -> LimitAction {
        LimitAction::from_string(&self.limit_action)
    }

    /// Warning thresholds in ascending order without duplicates or
    /// out-of-range values. Falls back to `DEFAULT_WARNING_THRESHOLDS` when
    /// none of the configured values are usable.
    pub fn thresholds(&self) -> Vec<i32> {
        let mut thresholds: Vec<i32> = self
            .warning_thresholds
            .iter()
            .copied()
            .filter(|t| *t > 0 && *t <= 100)
            .collect();
        if thresholds.is_empty() {
            return DEFAULT_WARNING_THRESHOLDS.to_vec();
        }
        thresholds.sort_unstable();
        thresholds.dedup();
        thresholds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub product_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub usage_webhook_url: Option<String>,
}
