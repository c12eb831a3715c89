//! Stripe metered-billing client.
//!
//! Implements the usage-record API for metered subscription items.

use crate::config::StripeConfig;
use crate::services::reporter::{BillingProvider, ProviderError, ProviderUsageRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use service_core::http::{retry_with_backoff, RetryConfig};
use service_core::observability::TracedClientExt;

#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
    retry: RetryConfig,
}

/// Usage record as returned by Stripe.
#[derive(Debug, Deserialize)]
struct StripeUsageRecord {
    id: String,
    quantity: i64,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let retry = RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::quick()
        };
        Self {
            client: Client::new(),
            config,
            retry,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post_usage_record(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<ProviderUsageRecord, ProviderError> {
        let url = format!(
            "{}/v1/subscription_items/{}/usage_records",
            self.config.api_base_url.trim_end_matches('/'),
            subscription_item_id
        );
        let form = [
            ("quantity", quantity.to_string()),
            ("timestamp", timestamp.timestamp().to_string()),
            ("action", "increment".to_string()),
        ];

        let response = self
            .client
            .traced_post(&url)
            .bearer_auth(self.config.secret_key.expose_secret())
            .header("Idempotency-Key", idempotency_key)
            .timeout(self.config.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        tracing::debug!(status = %status, "Stripe usage_records response");

        if status.is_success() {
            let record: StripeUsageRecord = serde_json::from_str(&body)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            return Ok(ProviderUsageRecord {
                id: record.id,
                quantity: record.quantity,
            });
        }

        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .map(|b| {
                let code = b.error.code.unwrap_or_default();
                let message = b.error.message.unwrap_or_default();
                if code.is_empty() {
                    message
                } else {
                    format!("{}: {}", code, message)
                }
            })
            .unwrap_or(body);

        if status.as_u16() == 429 || status.is_server_error() {
            Err(ProviderError::Upstream {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    fn is_configured(&self) -> bool {
        !self.config.secret_key.expose_secret().is_empty()
    }

    async fn report_usage(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<ProviderUsageRecord, ProviderError> {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured);
        }

        retry_with_backoff(&self.retry, "stripe_report_usage", || {
            self.post_usage_record(subscription_item_id, quantity, timestamp, idempotency_key)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: &str) -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: Secret::new("sk_test_123".to_string()),
            api_base_url: base_url.to_string(),
            timeout: Duration::from_secs(2),
            max_retries: 2,
        })
        .with_retry(RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        })
    }

    #[tokio::test]
    async fn test_report_usage_posts_increment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscription_items/si_123/usage_records"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(header("idempotency-key", "usage-abc"))
            .and(body_string_contains("action=increment"))
            .and(body_string_contains("quantity=7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "mbur_1",
                "object": "usage_record",
                "quantity": 7,
                "subscription_item": "si_123",
                "timestamp": 1_700_000_000
            })))
            .expect(1)
            .mount(&server)
            .await;

        let record = client(&server.uri())
            .report_usage("si_123", 7, Utc::now(), "usage-abc")
            .await
            .unwrap();
        assert_eq!(record.id, "mbur_1");
        assert_eq!(record.quantity, 7);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": { "code": "resource_missing", "message": "No such subscription item" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .report_usage("si_missing", 1, Utc::now(), "usage-x")
            .await
            .unwrap_err();
        match err {
            ProviderError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert!(message.contains("resource_missing"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .report_usage("si_123", 1, Utc::now(), "usage-y")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_client_short_circuits() {
        let client = StripeClient::new(StripeConfig {
            secret_key: Secret::new(String::new()),
            api_base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(1),
            max_retries: 0,
        });
        assert!(!client.is_configured());
        let err = client
            .report_usage("si", 1, Utc::now(), "k")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured));
    }
}
