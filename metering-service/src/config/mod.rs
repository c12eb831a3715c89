//! Configuration module for metering-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeteringConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub stripe: StripeConfig,
    pub webhooks: WebhookConfig,
    pub usage: UsageConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Empty means usage reporting is disabled.
    pub secret_key: Secret<String>,
    pub api_base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub signing_secret: Secret<String>,
    pub signature_tolerance: Duration,
    /// Failed deliveries at or beyond this count are acknowledged and left
    /// for operator review.
    pub max_retries: i32,
    /// A `pending` event older than this is treated as abandoned by a crashed
    /// delivery and may be claimed again.
    pub claim_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UsageConfig {
    pub webhook_timeout: Duration,
    /// Serialize evaluate-then-write per subscription within this process.
    pub strict_limit_enforcement: bool,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub auth_service_endpoint: Option<String>,
    /// Local key table, `raw_key:tenant_id:scope|scope` entries separated by `;`.
    pub static_api_keys: Option<Secret<String>>,
}

impl MeteringConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "metering-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?),
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            stripe: StripeConfig {
                secret_key: Secret::new(env::var("STRIPE_SECRET_KEY").unwrap_or_default()),
                api_base_url: env::var("STRIPE_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                timeout: Duration::from_secs(parse_or("STRIPE_TIMEOUT_SECS", 10)),
                max_retries: parse_or("STRIPE_MAX_RETRIES", 2),
            },
            webhooks: WebhookConfig {
                signing_secret: Secret::new(env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("STRIPE_WEBHOOK_SECRET is required"))
                })?),
                signature_tolerance: Duration::from_secs(parse_or(
                    "WEBHOOK_SIGNATURE_TOLERANCE_SECS",
                    300,
                )),
                max_retries: parse_or("WEBHOOK_MAX_RETRIES", 5),
                claim_timeout: Duration::from_secs(parse_or("WEBHOOK_CLAIM_TIMEOUT_SECS", 120)),
            },
            usage: UsageConfig {
                webhook_timeout: Duration::from_secs(parse_or("USAGE_WEBHOOK_TIMEOUT_SECS", 5)),
                strict_limit_enforcement: parse_or("STRICT_LIMIT_ENFORCEMENT", true),
            },
            auth: AuthConfig {
                auth_service_endpoint: env::var("AUTH_SERVICE_ENDPOINT")
                    .ok()
                    .filter(|s| !s.is_empty()),
                static_api_keys: env::var("STATIC_API_KEYS").ok().map(Secret::new),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
