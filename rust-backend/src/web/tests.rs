use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::outbound::MockOutboundDispatcher;
use crate::pipeline::EmailPipeline;
use crate::quota::month_key;
use crate::reply::{GeneratedReply, MockReplyGenerator};
use crate::store::{
    NewTenant, PlanTier, Role, SettingsStore, SqliteStore, SubscriptionStatus, Tenant,
    TenantStore, UsageStore,
};
use crate::web::signature::tests::{mailgun_signature, stripe_header};
use crate::web::{router, AppState};
use crate::Config;

const MAILGUN_KEY: &str = "mg-signing-key";
const CLOUDFLARE_TOKEN: &str = "cf-token";
const STRIPE_SECRET: &str = "whsec_test";

struct Harness {
    app: Router,
    store: Arc<SqliteStore>,
    state: AppState,
}

fn test_config() -> Config {
    Config {
        jwt_secret: Some("test-jwt-secret".to_string()),
        mailgun_signing_key: Some(MAILGUN_KEY.to_string()),
        cloudflare_auth_token: Some(CLOUDFLARE_TOKEN.to_string()),
        stripe_webhook_secret: Some(STRIPE_SECRET.to_string()),
        ..Config::default()
    }
}

async fn harness(config: Config) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());

    let mut generator = MockReplyGenerator::new();
    generator.expect_generate().returning(|_, _| {
        Ok(GeneratedReply {
            text: "Thanks for reaching out.".to_string(),
            tokens_used: Some(42),
        })
    });
    let mut dispatcher = MockOutboundDispatcher::new();
    dispatcher.expect_dispatch().returning(|_| Ok(()));

    let pipeline = EmailPipeline::with_store(
        store.clone(),
        Arc::new(generator),
        Arc::new(dispatcher),
        &config,
    );
    let state = AppState::new(config, store.clone(), pipeline);

    Harness {
        app: router(state.clone()),
        store,
        state,
    }
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn tenant(&self, email: &str, role: Role) -> Tenant {
        self.store
            .get_or_create_tenant(&NewTenant {
                email: email.to_string(),
                name: String::new(),
                role,
                monthly_quota: 200,
            })
            .await
            .unwrap()
    }

    async fn token_for(&self, email: &str, role: Role) -> String {
        let tenant = self.tenant(email, role).await;
        self.state.tokens.issue(&tenant).unwrap()
    }
}

async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn now_secs() -> u64 {
    Utc::now().timestamp() as u64
}

fn form_encode(pairs: &[(&str, &str)]) -> String {
    fn encode(s: &str) -> String {
        s.bytes()
            .map(|b| match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    (b as char).to_string()
                }
                _ => format!("%{:02X}", b),
            })
            .collect()
    }
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn mailgun_form(recipient: &str, message_id: &str, key: &str) -> String {
    let timestamp = now_secs().to_string();
    let signature = mailgun_signature(key, &timestamp, "tok");
    form_encode(&[
        ("recipient", recipient),
        ("sender", "c@customer.example"),
        ("from", "Customer <c@customer.example>"),
        ("subject", "Order status"),
        ("body-plain", "Where is my order?"),
        ("Message-Id", message_id),
        ("timestamp", &timestamp),
        ("token", "tok"),
        ("signature", &signature),
    ])
}

fn form_request(uri: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_carries_security_headers() {
    let h = harness(test_config()).await;

    let response = h.send(get_request("/health", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(
        response.headers()["referrer-policy"],
        "strict-origin-when-cross-origin"
    );
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "replymint-backend");
}

#[tokio::test]
async fn test_ready_reports_database() {
    let h = harness(test_config()).await;

    let response = h.send(get_request("/ready", None)).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["database"], "healthy");
    assert_eq!(body["environment"], "test");
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_mailgun_inbound_runs_pipeline() {
    let h = harness(test_config()).await;

    let response = h
        .send(form_request(
            "/webhooks/mailgun/inbound",
            mailgun_form("support@tenant.example", "<m1@customer.example>", MAILGUN_KEY),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant_id"], "support@tenant.example");
    assert_eq!(body["status"], "generated");
    assert_eq!(body["reply_preview"], "Thanks for reaching out.");
    assert_eq!(body["usage"]["count"], 1);
    assert_eq!(body["usage"]["quota"], 200);
    assert_eq!(body["outbound_status"], "queued");
    assert_eq!(body["duplicate"], false);
}

#[tokio::test]
async fn test_mailgun_redelivery_is_charged_once() {
    let h = harness(test_config()).await;

    for _ in 0..2 {
        let response = h
            .send(form_request(
                "/webhooks/mailgun/inbound",
                mailgun_form("support@tenant.example", "<dup@customer.example>", MAILGUN_KEY),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let usage = h
        .store
        .get_usage("support@tenant.example", &month_key(Utc::now()))
        .await
        .unwrap();
    assert_eq!(usage, Some(1));
}

#[tokio::test]
async fn test_mailgun_forged_signature_is_rejected() {
    let h = harness(test_config()).await;

    let response = h
        .send(form_request(
            "/webhooks/mailgun/inbound",
            mailgun_form("support@tenant.example", "<m1@x>", "wrong-key"),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn test_strict_mode_rejects_missing_secret() {
    let h = harness(Config {
        jwt_secret: Some("test-jwt-secret".to_string()),
        ..Config::default()
    })
    .await;

    let response = h
        .send(form_request(
            "/webhooks/mailgun/inbound",
            mailgun_form("support@tenant.example", "<m1@x>", "anything"),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_relaxed_mode_admits_and_validates_recipient() {
    let h = harness(Config {
        strict_signature_check: false,
        ..Config::default()
    })
    .await;

    let response = h
        .send(form_request(
            "/webhooks/mailgun/inbound",
            form_encode(&[("sender", "c@customer.example"), ("subject", "Hi")]),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .send(form_request(
            "/webhooks/mailgun/inbound",
            form_encode(&[
                ("recipient", "support@tenant.example"),
                ("sender", "c@customer.example"),
                ("subject", "Hi"),
            ]),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_mailgun_events_acknowledged() {
    let h = harness(test_config()).await;
    let timestamp = now_secs().to_string();
    let signature = mailgun_signature(MAILGUN_KEY, &timestamp, "tok");

    let response = h
        .send(form_request(
            "/webhooks/mailgun/events",
            form_encode(&[
                ("event", "delivered"),
                ("recipient", "c@customer.example"),
                ("timestamp", &timestamp),
                ("token", "tok"),
                ("signature", &signature),
            ]),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "received");
}

#[tokio::test]
async fn test_cloudflare_inbound_checks_token() {
    let h = harness(test_config()).await;
    let payload = json!({
        "from": "c@customer.example",
        "to": "support@tenant.example",
        "subject": "",
        "timestamp": "2026-10-01T00:00:00Z",
        "raw_content": "Message-ID: <cf1@customer.example>\r\nSubject: Refund\r\nContent-Type: text/plain\r\n\r\nPlease refund me.\r\n",
    });

    let request = |token: &str| {
        Request::builder()
            .method("POST")
            .uri("/webhooks/cloudflare/inbound")
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Custom-Auth", token)
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let response = h.send(request("nope")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h.send(request(CLOUDFLARE_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "generated");
    assert_eq!(body["usage"]["count"], 1);
}

#[tokio::test]
async fn test_stripe_checkout_creates_paid_tenant() {
    let h = harness(test_config()).await;
    let payload = json!({
        "id": "evt_1",
        "type": "checkout.session.completed",
        "data": {"object": {
            "customer_details": {"email": "Buyer@Example.com", "name": "Buyer"},
            "metadata": {"plan_tier": "business"},
        }},
    })
    .to_string();

    let request = |signature: String| {
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header(header::CONTENT_TYPE, "application/json")
            .header("Stripe-Signature", signature)
            .body(Body::from(payload.clone()))
            .unwrap()
    };

    let forged = stripe_header("whsec_other", now_secs(), payload.as_bytes());
    assert_eq!(h.send(request(forged)).await.status(), StatusCode::UNAUTHORIZED);

    let signed = stripe_header(STRIPE_SECRET, now_secs(), payload.as_bytes());
    let response = h.send(request(signed)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["handled"], true);

    let tenant = h.store.get_tenant("buyer@example.com").await.unwrap().unwrap();
    assert_eq!(tenant.plan_tier, PlanTier::Business);
    assert_eq!(tenant.monthly_quota, 5_000);
    assert_eq!(tenant.subscription_status, SubscriptionStatus::Active);
}

// =============================================================================
// Users and tenant API
// =============================================================================

#[tokio::test]
async fn test_login_then_profile() {
    let h = harness(test_config()).await;

    let response = h
        .send(json_request(
            "POST",
            "/api/v1/users/login",
            None,
            json!({"email": " New@Example.com ", "name": "New"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user"]["tenantId"], "new@example.com");
    assert_eq!(body["user"]["role"], "user");
    let token = body["token"].as_str().unwrap().to_string();

    let response = h.send(get_request("/api/v1/users/profile", Some(&token))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["user"]["email"], "new@example.com");

    let response = h.send(get_request("/api/v1/users/profile", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .send(get_request("/api/v1/users/profile", Some("not-a-jwt")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_repeat_login_reuses_tenant() {
    let h = harness(test_config()).await;
    let login = |email: &'static str| {
        json_request("POST", "/api/v1/users/login", None, json!({"email": email}))
    };

    let first = body_json(h.send(login("Pat <pat@example.com>")).await).await;
    let second = body_json(h.send(login("PAT@example.com")).await).await;

    assert_eq!(first["user"]["tenantId"], "pat@example.com");
    assert_eq!(second["user"]["tenantId"], "pat@example.com");
    assert_eq!(h.store.tenant_stats().await.unwrap().total, 1);

    let token = second["token"].as_str().unwrap();
    assert_eq!(h.state.tokens.verify(token).unwrap().sub, "pat@example.com");
}

#[tokio::test]
async fn test_login_without_jwt_secret_is_unavailable() {
    let h = harness(Config {
        jwt_secret: None,
        ..test_config()
    })
    .await;

    let response = h
        .send(json_request(
            "POST",
            "/api/v1/users/login",
            None,
            json!({"email": "a@example.com"}),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_login_requires_email() {
    let h = harness(test_config()).await;

    let response = h
        .send(json_request("POST", "/api/v1/users/login", None, json!({"name": "x"})))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["detail"], "email is required");
}

#[tokio::test]
async fn test_settings_partial_update() {
    let h = harness(test_config()).await;
    let token = h.token_for("a@example.com", Role::User).await;

    let response = h
        .send(json_request(
            "PUT",
            "/api/v1/settings",
            Some(&token),
            json!({"tone": "friendly"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["updated_fields"], json!(["tone"]));

    let response = h.send(get_request("/api/v1/settings", Some(&token))).await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["tone"], "friendly");
    assert_eq!(body["data"]["max_length"], 700);

    let response = h
        .send(json_request("PUT", "/api/v1/settings", Some(&token), json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_usage_and_dashboard() {
    let h = harness(test_config()).await;
    let token = h.token_for("a@example.com", Role::User).await;

    let response = h.send(get_request("/api/v1/usage", Some(&token))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["current_month"]["quota"], 200);
    assert_eq!(body["data"]["status"], "active");

    let response = h
        .send(get_request("/api/v1/dashboard/overview", Some(&token)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["plan"]["name"], "Starter");
    assert_eq!(body["data"]["plan"]["remaining"], 200);
    assert_eq!(body["data"]["last_email"], Value::Null);

    let response = h.send(get_request("/api/v1/logs", Some(&token))).await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["pagination"]["limit"], 50);
    assert_eq!(body["data"]["pagination"]["has_more"], false);
}

// =============================================================================
// Admin
// =============================================================================

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let h = harness(test_config()).await;
    let user_token = h.token_for("u@example.com", Role::User).await;

    let response = h
        .send(get_request("/api/v1/admin/stats", Some(&user_token)))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h.send(get_request("/api/v1/admin/stats", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .send(json_request(
            "POST",
            "/api/v1/users/admin/create",
            Some(&user_token),
            json!({"email": "x@example.com"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_quota_update_resets_usage() {
    let h = harness(test_config()).await;
    let admin = h.token_for("root@example.com", Role::Admin).await;
    h.tenant("u@example.com", Role::User).await;

    let month = month_key(Utc::now());
    h.store.touch("u@example.com", &month).await.unwrap();
    h.store
        .try_increment("u@example.com", &month, 7, i64::MAX)
        .await
        .unwrap();

    let response = h
        .send(json_request(
            "PUT",
            "/api/v1/admin/users/u@example.com",
            Some(&admin),
            json!({"monthly_quota": 50, "email": "ignored@example.com"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["updated_fields"],
        json!(["monthly_quota"])
    );

    assert_eq!(h.store.get_usage("u@example.com", &month).await.unwrap(), Some(0));
    let tenant = h.store.get_tenant("u@example.com").await.unwrap().unwrap();
    assert_eq!(tenant.monthly_quota, 50);

    let response = h
        .send(json_request(
            "PUT",
            "/api/v1/admin/users/u@example.com",
            Some(&admin),
            json!({"email": "ignored@example.com"}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .send(json_request(
            "PUT",
            "/api/v1/admin/users/u@example.com",
            Some(&admin),
            json!({"monthly_quota": -1}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .send(json_request(
            "PUT",
            "/api/v1/admin/users/missing@example.com",
            Some(&admin),
            json!({"monthly_quota": 5}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_disable_and_details() {
    let h = harness(test_config()).await;
    let admin = h.token_for("root@example.com", Role::Admin).await;
    h.tenant("u@example.com", Role::User).await;

    let response = h
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/api/v1/admin/users/u@example.com")
                .header(header::AUTHORIZATION, format!("Bearer {}", admin))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["message"], "User disabled successfully");

    let tenant = h.store.get_tenant("u@example.com").await.unwrap().unwrap();
    assert_eq!(tenant.subscription_status, SubscriptionStatus::Disabled);
    let settings = h.store.get_settings("u@example.com").await.unwrap().unwrap();
    assert!(!settings.auto_reply_enabled);

    let response = h
        .send(get_request("/api/v1/admin/users/u@example.com", Some(&admin)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["user"]["subscription_status"], "disabled");
    assert_eq!(body["data"]["settings"]["auto_reply_enabled"], false);

    let response = h
        .send(get_request("/api/v1/admin/users?limit=1", Some(&admin)))
        .await;
    let body = body_json(response).await;
    assert_eq!(body["data"]["users"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["pagination"]["total"], 2);
    assert_eq!(body["data"]["pagination"]["has_more"], true);
}

#[tokio::test]
async fn test_admin_create_promotes_existing_user() {
    let h = harness(test_config()).await;
    let admin = h.token_for("root@example.com", Role::Admin).await;
    h.tenant("u@example.com", Role::User).await;

    let response = h
        .send(json_request(
            "POST",
            "/api/v1/users/admin/create",
            Some(&admin),
            json!({"email": "U@example.com"}),
        ))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["message"], "Admin user created successfully");
    assert_eq!(body["user"]["role"], "admin");
    let tenant = h.store.get_tenant("u@example.com").await.unwrap().unwrap();
    assert_eq!(tenant.role, Role::Admin);
}
