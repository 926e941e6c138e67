mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;

use common::fixtures::{
    FakeGateway, Harness, checkout_completed_event, checkout_service, signed, subscription,
};
use videohub::auth::JwtService;
use videohub::quota::QuotaLedger;
use videohub::users::User;
use videohub::web::{AppState, router};

const JWT_SECRET: &str = "http-test-secret";

struct TestApp {
    harness: Harness,
    app: axum::Router,
    jwt: Arc<JwtService>,
}

impl TestApp {
    fn new() -> Self {
        let harness = Harness::new();
        let jwt = Arc::new(JwtService::new(JWT_SECRET));
        let state = AppState {
            stores: harness.stores.clone(),
            engine: harness.engine.clone(),
            quota: QuotaLedger::new(harness.stores.clone()),
            checkout: checkout_service(harness.stores.clone(), Arc::new(FakeGateway::default())),
            jwt: jwt.clone(),
            metrics: None,
        };

        Self {
            app: router(state),
            harness,
            jwt,
        }
    }

    fn bearer(&self, user: &User) -> String {
        format!("Bearer {}", self.jwt.generate_token(user).unwrap())
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn send_json(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let (status, body) = self.send(request).await;
        (status, serde_json::from_str(&body).unwrap())
    }
}

fn webhook_request(body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/payments/webhook")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_webhook_accepts_signed_delivery() {
    let app = TestApp::new();
    let alice = app.harness.add_user("alice").await;
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", alice.id, 1, true);
    let (body, signature) = signed(&event, Utc::now());

    let (status, text) = app.send(webhook_request(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "Webhook received");
    assert_eq!(app.harness.store.subscription_count().await, 1);
}

#[tokio::test]
async fn test_webhook_rejects_missing_and_bad_signatures() {
    let app = TestApp::new();
    let alice = app.harness.add_user("alice").await;
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", alice.id, 1, true);
    let (body, _) = signed(&event, Utc::now());

    let (status, text) = app.send(webhook_request(body.clone(), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Missing signature");

    let forged = format!("t={},v1={}", Utc::now().timestamp(), "00".repeat(32));
    let (status, text) = app.send(webhook_request(body, Some(&forged))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Invalid signature");

    assert_eq!(app.harness.store.webhook_event_count().await, 0);
    assert_eq!(app.harness.store.payment_count().await, 0);
}

#[tokio::test]
async fn test_webhook_rejects_signed_garbage() {
    let app = TestApp::new();
    let body = b"not json at all".to_vec();
    let signature = videohub::webhook_signature::sign(
        &body,
        common::fixtures::WEBHOOK_SECRET,
        Utc::now().timestamp(),
    )
    .unwrap();

    let (status, text) = app.send(webhook_request(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text, "Invalid payload");
}

#[tokio::test]
async fn test_authenticated_routes_require_a_token() {
    let app = TestApp::new();

    for uri in ["/payments", "/subscription", "/watch/limit"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, _) = app.send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
    }

    let request = Request::builder()
        .uri("/payments")
        .header(header::AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_watch_check_asks_anonymous_viewers_to_log_in() {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/watch/check")
        .body(Body::empty())
        .unwrap();

    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["allowed"], false);
    assert_eq!(body["data"]["reason"], "Please login to watch movies");
}

#[tokio::test]
async fn test_watch_progress_updates_the_limit() {
    let app = TestApp::new();
    let bob = app.harness.add_user("bob").await;
    let auth = app.bearer(&bob);

    let request = Request::builder()
        .method("POST")
        .uri("/watch/progress")
        .header(header::AUTHORIZATION, &auth)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"watchTime": 1500}"#))
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["watchedSeconds"], 1500);
    assert_eq!(body["data"]["remainingSeconds"], 2100);
    assert_eq!(body["data"]["canWatch"], true);
    assert_eq!(body["data"]["message"], "You have 35 minutes remaining today");

    let request = Request::builder()
        .uri("/watch/limit")
        .header(header::AUTHORIZATION, &auth)
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["watchedSeconds"], 1500);
    assert_eq!(body["data"]["hasSubscription"], false);
}

#[tokio::test]
async fn test_watch_progress_caps_oversized_reports() {
    let app = TestApp::new();
    let dave = app.harness.add_user("dave").await;
    let auth = app.bearer(&dave);

    for _ in 0..2 {
        let request = Request::builder()
            .method("POST")
            .uri("/watch/progress")
            .header(header::AUTHORIZATION, &auth)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"watchTime": 2147483647}"#))
            .unwrap();
        let (status, body) = app.send_json(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["remainingSeconds"], 0);
        assert_eq!(body["data"]["canWatch"], false);
    }
}

#[tokio::test]
async fn test_subscriber_watch_limit_is_unlimited() {
    let app = TestApp::new();
    let carol = app.harness.add_user("carol").await;
    app.harness
        .store
        .put_subscription(subscription(carol.id, Utc::now() + Duration::days(20), true))
        .await;

    let request = Request::builder()
        .uri("/watch/limit")
        .header(header::AUTHORIZATION, app.bearer(&carol))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["hasSubscription"], true);
    assert_eq!(body["data"]["remainingSeconds"], serde_json::Value::Null);
    assert_eq!(body["data"]["canWatch"], true);
}

#[tokio::test]
async fn test_payments_are_scoped_to_the_caller() {
    let app = TestApp::new();
    let alice = app.harness.add_user("alice").await;
    let mallory = app.harness.add_user("mallory").await;
    let event = checkout_completed_event("evt_1", "cs_1", "pi_1", alice.id, 2, true);
    app.harness.deliver(&event, Utc::now()).await.unwrap();

    let request = Request::builder()
        .uri("/payments")
        .header(header::AUTHORIZATION, app.bearer(&alice))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    let payments = body["data"].as_array().unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0]["status"], "succeeded");
    assert_eq!(payments[0]["amount"], "24.00");
    assert_eq!(payments[0]["subscriptionMonths"], 2);
    let payment_id = payments[0]["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/payments/{}", payment_id))
        .header(header::AUTHORIZATION, app.bearer(&mallory))
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/subscription")
        .header(header::AUTHORIZATION, app.bearer(&alice))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["isActive"], true);
    assert_eq!(body["data"]["isExpired"], false);
}

#[tokio::test]
async fn test_checkout_validates_months() {
    let app = TestApp::new();
    let alice = app.harness.add_user("alice").await;

    let request = Request::builder()
        .method("POST")
        .uri("/payments/checkout")
        .header(header::AUTHORIZATION, app.bearer(&alice))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"subscriptionMonths": 24}"#))
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"], "Invalid subscription duration.");

    let request = Request::builder()
        .method("POST")
        .uri("/payments/checkout")
        .header(header::AUTHORIZATION, app.bearer(&alice))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = app.send_json(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sessionId"], "cs_test_1");
}

#[tokio::test]
async fn test_metrics_disabled_without_recorder() {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
