//! Best-effort per-product usage webhook.

use crate::models::UsageRecord;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageWebhookPayload<'a> {
    pub subscription_id: Uuid,
    pub user_id: &'a str,
    pub quantity: i64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<&'a serde_json::Value>,
}

impl<'a> From<&'a UsageRecord> for UsageWebhookPayload<'a> {
    fn from(record: &'a UsageRecord) -> Self {
        Self {
            subscription_id: record.subscription_id,
            user_id: &record.user_id,
            quantity: record.quantity,
            timestamp: record.timestamp,
            metadata: record.metadata.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct UsageWebhookClient {
    client: Client,
    timeout: Duration,
}

impl UsageWebhookClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }

    /// POST the record to `url`. Callers log failures; they never affect the
    /// ingestion result.
    pub async fn send(&self, url: &str, record: &UsageRecord) -> anyhow::Result<()> {
        let response = self
            .client
            .traced_post(url)
            .timeout(self.timeout)
            .json(&UsageWebhookPayload::from(record))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("usage webhook returned {}", status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> UsageRecord {
        UsageRecord {
            record_id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            tenant_id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            quantity: 3,
            timestamp: Utc::now(),
            metadata: Some(serde_json::json!({"feature": "export"})),
            reported_at: None,
            created_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_posts_usage_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/usage"))
            .and(body_partial_json(serde_json::json!({
                "subscriptionId": "00000000-0000-0000-0000-000000000000",
                "userId": "user-1",
                "quantity": 3,
                "metadata": {"feature": "export"}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = UsageWebhookClient::new(Duration::from_secs(2));
        client
            .send(&format!("{}/hooks/usage", server.uri()), &record())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = UsageWebhookClient::new(Duration::from_secs(2));
        assert!(client.send(&server.uri(), &record()).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = UsageWebhookClient::new(Duration::from_millis(50));
        assert!(client.send(&server.uri(), &record()).await.is_err());
    }
}
