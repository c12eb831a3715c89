//! Test helper module for metering-service integration tests.
//!
//! Builds the full router over an `InMemoryStore` and a scriptable billing
//! provider, and drives it in-process with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use http_body_util::BodyExt;
use metering_service::config::{UsageConfig, WebhookConfig};
use metering_service::models::{Product, Subscription, Tier};
use metering_service::services::{
    BillingProvider, InMemoryStore, ProviderError, ProviderUsageRecord, StaticKeyVerifier,
    SCOPE_BILLING_ADMIN, SCOPE_USAGE_READ, SCOPE_USAGE_WRITE,
};
use metering_service::{build_router, AppState};
use secrecy::Secret;
use serde_json::Value;
use service_core::utils::signature::compute_hmac_sha256_hex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const TENANT_A: Uuid = Uuid::from_u128(0x1111_1111_1111_1111_1111_1111_1111_1111);
pub const TENANT_B: Uuid = Uuid::from_u128(0x2222_2222_2222_2222_2222_2222_2222_2222);

/// Tenant A, usage read and write.
pub const KEY_A: &str = "key-tenant-a";
/// Tenant A, read only.
pub const KEY_A_READ: &str = "key-tenant-a-read";
/// Tenant A, operator.
pub const KEY_A_ADMIN: &str = "key-tenant-a-admin";
/// Tenant B, usage read and write.
pub const KEY_B: &str = "key-tenant-b";

pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const WEBHOOK_MAX_RETRIES: i32 = 2;

/// A usage report seen by [`MockProvider`].
#[derive(Debug, Clone)]
pub struct ProviderCall {
    pub subscription_item_id: String,
    pub quantity: i64,
    pub idempotency_key: String,
}

/// Billing provider double. Succeeds unless told to fail.
#[derive(Default)]
pub struct MockProvider {
    failing: AtomicBool,
    calls: Mutex<Vec<ProviderCall>>,
}

impl MockProvider {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillingProvider for MockProvider {
    fn is_configured(&self) -> bool {
        true
    }

    async fn report_usage(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        _timestamp: DateTime<Utc>,
        idempotency_key: &str,
    ) -> Result<ProviderUsageRecord, ProviderError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Upstream {
                status: 503,
                message: "provider unavailable".to_string(),
            });
        }
        self.calls.lock().unwrap().push(ProviderCall {
            subscription_item_id: subscription_item_id.to_string(),
            quantity,
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(ProviderUsageRecord {
            id: format!("mbur_{}", idempotency_key),
            quantity,
        })
    }
}

/// Shape of the tier a test subscription is seeded with.
#[derive(Debug, Clone)]
pub struct TierSpec {
    pub usage_limit: Option<i64>,
    pub limit_action: &'static str,
    pub overage_allowed: bool,
    pub warning_thresholds: Vec<i32>,
    pub usage_webhook_url: Option<String>,
    pub metering_enabled: bool,
}

impl TierSpec {
    pub fn limited(limit: i64, action: &'static str) -> Self {
        Self {
            usage_limit: Some(limit),
            limit_action: action,
            overage_allowed: action == "overage",
            warning_thresholds: vec![80, 90, 95],
            usage_webhook_url: None,
            metering_enabled: true,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            usage_limit: None,
            ..Self::limited(0, "warn")
        }
    }

    /// Flat-rate tier: usage is enforced but never reported to the provider.
    pub fn flat_rate(mut self) -> Self {
        self.metering_enabled = false;
        self
    }

    pub fn with_thresholds(mut self, thresholds: Vec<i32>) -> Self {
        self.warning_thresholds = thresholds;
        self
    }

    pub fn with_webhook(mut self, url: String) -> Self {
        self.usage_webhook_url = Some(url);
        self
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<MockProvider>,
}

impl TestApp {
    pub fn spawn() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(MockProvider::default());
        let verifier = StaticKeyVerifier::new()
            .with_key(KEY_A, TENANT_A, &[SCOPE_USAGE_WRITE, SCOPE_USAGE_READ])
            .with_key(KEY_A_READ, TENANT_A, &[SCOPE_USAGE_READ])
            .with_key(KEY_A_ADMIN, TENANT_A, &[SCOPE_BILLING_ADMIN])
            .with_key(KEY_B, TENANT_B, &["usage:*"]);

        let webhooks = WebhookConfig {
            signing_secret: Secret::new(WEBHOOK_SECRET.to_string()),
            signature_tolerance: std::time::Duration::from_secs(300),
            max_retries: WEBHOOK_MAX_RETRIES,
            claim_timeout: std::time::Duration::from_secs(120),
        };
        let usage = UsageConfig {
            webhook_timeout: std::time::Duration::from_secs(2),
            strict_limit_enforcement: true,
        };

        let state = AppState::new(
            store.clone(),
            provider.clone(),
            Arc::new(verifier),
            &webhooks,
            &usage,
        );

        Self {
            router: build_router(state),
            store,
            provider,
        }
    }

    /// Seed a product, tier and active, provider-linked subscription owned by `tenant_id`.
    pub async fn seed_subscription(&self, tenant_id: Uuid, tier_spec: TierSpec) -> Subscription {
        let product = Product {
            product_id: Uuid::new_v4(),
            tenant_id,
            name: "Search API".to_string(),
            usage_webhook_url: tier_spec.usage_webhook_url.clone(),
        };
        let tier = Tier {
            tier_id: Uuid::new_v4(),
            product_id: product.product_id,
            name: "Pro".to_string(),
            usage_limit: tier_spec.usage_limit,
            limit_action: tier_spec.limit_action.to_string(),
            overage_allowed: tier_spec.overage_allowed,
            warning_thresholds: tier_spec.warning_thresholds.clone(),
            metering_enabled: tier_spec.metering_enabled,
        };

        let now = Utc::now();
        let subscription_id = Uuid::new_v4();
        let subscription = Subscription {
            subscription_id,
            tenant_id,
            tier_id: tier.tier_id,
            user_id: format!("user-{}", &subscription_id.to_string()[..8]),
            subscriber_email: Some("owner@example.com".to_string()),
            status: "active".to_string(),
            current_period_start: now - Duration::days(1),
            current_period_end: now + Duration::days(29),
            cancel_at_period_end: false,
            stripe_subscription_id: Some(format!("sub_{}", subscription_id.simple())),
            stripe_subscription_item_id: Some(format!("si_{}", subscription_id.simple())),
            last_reported_usage: None,
            last_reported_at: None,
            provider_synced_at: None,
            period_synced_at: None,
            created_utc: now,
            updated_utc: now,
        };

        self.store.insert_product(product).await;
        self.store.insert_tier(tier).await;
        self.store.insert_subscription(subscription.clone()).await;
        subscription
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

        TestResponse { status, body }
    }

    pub async fn get(&self, uri: &str, api_key: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn post_json(&self, uri: &str, api_key: Option<&str>, body: &Value) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    pub async fn record_usage(
        &self,
        api_key: &str,
        subscription: &Subscription,
        quantity: i64,
    ) -> TestResponse {
        self.post_json(
            "/usage",
            Some(api_key),
            &serde_json::json!({
                "subscriptionId": subscription.subscription_id,
                "userId": subscription.user_id,
                "quantity": quantity,
            }),
        )
        .await
    }

    /// Deliver a webhook signed with the shared secret.
    pub async fn deliver_webhook(&self, event: &Value) -> TestResponse {
        let payload = event.to_string();
        let header = sign_webhook(payload.as_bytes(), Utc::now().timestamp());
        self.deliver_raw_webhook(payload, Some(&header)).await
    }

    pub async fn deliver_raw_webhook(&self, payload: String, signature: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/billing-provider")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        self.send(builder.body(Body::from(payload)).unwrap()).await
    }
}

pub fn sign_webhook(payload: &[u8], timestamp: i64) -> String {
    let mut signed = format!("{}.", timestamp).into_bytes();
    signed.extend_from_slice(payload);
    let signature = compute_hmac_sha256_hex(WEBHOOK_SECRET.as_bytes(), &signed).unwrap();
    format!("t={},v1={}", timestamp, signature)
}

/// Provider event envelope.
pub fn provider_event(id: &str, event_type: &str, created: i64, object: Value) -> Value {
    serde_json::json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object },
    })
}
