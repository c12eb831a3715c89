//! Usage ingestion integration tests for metering-service.

mod common;

use axum::http::StatusCode;
use common::{TestApp, TierSpec, KEY_A, KEY_A_READ, KEY_B, TENANT_A};
use metering_service::services::MeteringStore;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn approx(value: &serde_json::Value, expected: f64) -> bool {
    value
        .as_f64()
        .map_or(false, |v| (v - expected).abs() < 1e-9)
}

#[tokio::test]
async fn block_tier_rejects_write_that_would_exceed_limit() {
    // Arrange
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "block"))
        .await;
    assert_eq!(app.record_usage(KEY_A, &sub, 90).await.status, StatusCode::CREATED);

    // Act
    let blocked = app.record_usage(KEY_A, &sub, 15).await;

    // Assert
    assert_eq!(blocked.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(blocked.body["limits"]["limit"], 100);
    assert_eq!(blocked.body["limits"]["currentUsage"], 90);
    assert_eq!(blocked.body["limits"]["requestedQuantity"], 15);
    assert!(approx(&blocked.body["limits"]["percentage"], 105.0));
    assert_eq!(app.store.usage_records().await.len(), 1);

    // Exactly reaching the limit is allowed
    let at_limit = app.record_usage(KEY_A, &sub, 10).await;
    assert_eq!(at_limit.status, StatusCode::CREATED);
    assert_eq!(at_limit.body["limits"]["newTotal"], 100);
    assert_eq!(app.store.usage_records().await.len(), 2);
}

#[tokio::test]
async fn overage_tier_accepts_write_past_limit_with_warning() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "overage"))
        .await;
    app.record_usage(KEY_A, &sub, 90).await;

    let response = app.record_usage(KEY_A, &sub, 15).await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["limits"]["allowed"], true);
    assert_eq!(response.body["limits"]["action"], "warn");
    assert_eq!(response.body["limits"]["newTotal"], 105);
    assert_eq!(response.body["stripeReported"], true);
    assert_eq!(app.store.usage_records().await.len(), 2);
}

#[tokio::test]
async fn threshold_notification_fires_once_per_period() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "warn"))
        .await;

    let first = app.record_usage(KEY_A, &sub, 82).await;
    assert_eq!(first.status, StatusCode::CREATED);
    assert_eq!(first.body["thresholdEvent"]["eventType"], "warning");
    assert!(approx(&first.body["thresholdEvent"]["threshold"], 0.8));

    let second = app.record_usage(KEY_A, &sub, 1).await;
    assert_eq!(second.status, StatusCode::CREATED);
    assert!(second.body.get("thresholdEvent").is_none());

    let notifications = app.store.notifications().await;
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].notification_type, "usage_warning");
    assert_eq!(notifications[0].recipient.as_deref(), Some("owner@example.com"));
}

#[tokio::test]
async fn tier_without_thresholds_uses_default_warnings() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(
            TENANT_A,
            TierSpec::limited(100, "warn").with_thresholds(vec![]),
        )
        .await;

    let response = app.record_usage(KEY_A, &sub, 85).await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["thresholdEvent"]["eventType"], "warning");
    assert!(approx(&response.body["thresholdEvent"]["threshold"], 0.8));
    let events = app.store.list_limit_events(sub.subscription_id).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn jump_across_several_thresholds_fires_only_the_highest() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "warn"))
        .await;

    let quiet = app.record_usage(KEY_A, &sub, 70).await;
    assert!(quiet.body.get("thresholdEvent").is_none());

    let jump = app.record_usage(KEY_A, &sub, 27).await;
    assert_eq!(jump.body["thresholdEvent"]["eventType"], "critical");
    assert!(approx(&jump.body["thresholdEvent"]["threshold"], 0.95));

    let events = app.store.list_limit_events(sub.subscription_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(app.store.notifications().await.len(), 1);
    assert_eq!(
        app.store.notifications().await[0].notification_type,
        "usage_critical"
    );
}

#[tokio::test]
async fn repeated_blocks_notify_once_but_are_all_recorded() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(10, "block"))
        .await;
    assert_eq!(app.record_usage(KEY_A, &sub, 10).await.status, StatusCode::CREATED);

    for _ in 0..2 {
        let blocked = app.record_usage(KEY_A, &sub, 1).await;
        assert_eq!(blocked.status, StatusCode::TOO_MANY_REQUESTS);
    }

    let exceeded: Vec<_> = app
        .store
        .list_limit_events(sub.subscription_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "exceeded")
        .collect();
    assert_eq!(exceeded.len(), 2);
    assert_eq!(exceeded.iter().filter(|e| e.notification_sent).count(), 1);

    let exceeded_notices = app
        .store
        .notifications()
        .await
        .into_iter()
        .filter(|n| n.notification_type == "usage_exceeded")
        .count();
    assert_eq!(exceeded_notices, 1);
    assert_eq!(app.store.usage_records().await.len(), 1);
}

#[tokio::test]
async fn unlimited_tier_omits_limits_and_never_notifies() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::unlimited())
        .await;

    let response = app.record_usage(KEY_A, &sub, 1_000_000).await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert!(response.body.get("limits").is_none());
    assert!(response.body.get("thresholdEvent").is_none());
    assert!(app
        .store
        .list_limit_events(sub.subscription_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn provider_failure_does_not_fail_ingestion() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(1000, "warn"))
        .await;
    app.provider.set_failing(true);

    let response = app.record_usage(KEY_A, &sub, 5).await;

    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(response.body["stripeReported"], false);
    let records = app.store.usage_records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].reported_at.is_none());
}

#[tokio::test]
async fn successful_report_marks_record_and_subscription() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(1000, "warn"))
        .await;

    let response = app.record_usage(KEY_A, &sub, 7).await;

    assert_eq!(response.body["stripeReported"], true);
    let record_id: Uuid = serde_json::from_value(response.body["usageRecord"]["recordId"].clone()).unwrap();

    let calls = app.provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].quantity, 7);
    assert_eq!(calls[0].idempotency_key, format!("usage-{}", record_id));
    assert_eq!(
        Some(calls[0].subscription_item_id.clone()),
        sub.stripe_subscription_item_id
    );

    let records = app.store.usage_records().await;
    assert!(records[0].reported_at.is_some());
    let stored = app.store.subscription(sub.subscription_id).await.unwrap();
    assert_eq!(stored.last_reported_usage, Some(7));
    assert!(stored.last_reported_at.is_some());
}

#[tokio::test]
async fn usage_webhook_receives_record_and_its_failure_is_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/usage-hook"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(
            TENANT_A,
            TierSpec::limited(1000, "warn").with_webhook(format!("{}/usage-hook", server.uri())),
        )
        .await;

    let response = app.record_usage(KEY_A, &sub, 3).await;
    assert_eq!(response.status, StatusCode::CREATED);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["subscriptionId"], json!(sub.subscription_id));
    assert_eq!(body["userId"], json!(sub.user_id));
    assert_eq!(body["quantity"], 3);
}

#[tokio::test]
async fn authentication_and_validation_errors() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "warn"))
        .await;
    let body = json!({
        "subscriptionId": sub.subscription_id,
        "userId": sub.user_id,
        "quantity": 1,
    });

    // Missing key
    assert_eq!(
        app.post_json("/usage", None, &body).await.status,
        StatusCode::UNAUTHORIZED
    );
    // Unknown key
    assert_eq!(
        app.post_json("/usage", Some("not-a-key"), &body).await.status,
        StatusCode::UNAUTHORIZED
    );
    // Key without usage:write
    assert_eq!(
        app.post_json("/usage", Some(KEY_A_READ), &body).await.status,
        StatusCode::FORBIDDEN
    );
    // Unknown subscription
    let unknown = json!({
        "subscriptionId": Uuid::new_v4(),
        "userId": "someone",
        "quantity": 1,
    });
    assert_eq!(
        app.post_json("/usage", Some(KEY_A), &unknown).await.status,
        StatusCode::NOT_FOUND
    );
    // Negative quantity
    let negative = json!({
        "subscriptionId": sub.subscription_id,
        "userId": sub.user_id,
        "quantity": -1,
    });
    assert_eq!(
        app.post_json("/usage", Some(KEY_A), &negative).await.status,
        StatusCode::BAD_REQUEST
    );
    // Malformed body
    let malformed = json!({ "subscriptionId": "nope" });
    assert_eq!(
        app.post_json("/usage", Some(KEY_A), &malformed).await.status,
        StatusCode::BAD_REQUEST
    );

    assert!(app.store.usage_records().await.is_empty());
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "warn"))
        .await;

    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/usage")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", KEY_A))
        .body(axum::body::Body::from(
            json!({
                "subscriptionId": sub.subscription_id,
                "userId": sub.user_id,
                "quantity": 1,
            })
            .to_string(),
        ))
        .unwrap();

    assert_eq!(app.send(request).await.status, StatusCode::CREATED);
}

#[tokio::test]
async fn cross_tenant_write_is_forbidden() {
    let app = TestApp::spawn();
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(100, "warn"))
        .await;

    let response = app.record_usage(KEY_B, &sub, 1).await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert!(app.store.usage_records().await.is_empty());
}

#[tokio::test]
async fn concurrent_writes_cannot_overshoot_block_limit() {
    let app = std::sync::Arc::new(TestApp::spawn());
    let sub = app
        .seed_subscription(TENANT_A, TierSpec::limited(10, "block"))
        .await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let app = app.clone();
        let sub = sub.clone();
        handles.push(tokio::spawn(async move {
            app.record_usage(KEY_A, &sub, 1).await.status
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::CREATED {
            created += 1;
        }
    }

    assert_eq!(created, 10);
    let total: i64 = app.store.usage_records().await.iter().map(|r| r.quantity).sum();
    assert_eq!(total, 10);
}
