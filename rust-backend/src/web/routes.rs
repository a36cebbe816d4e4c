//! Router assembly and cross-cutting layers.

use std::time::Duration;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::warn;

use crate::web::{admin, api, billing, handlers, users, AppState};

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/users/login", post(users::login))
        .route("/users/profile", get(users::profile))
        .route("/users/admin/create", post(users::create_admin))
        .route("/dashboard/overview", get(api::dashboard_overview))
        .route("/logs", get(api::email_logs))
        .route("/settings", get(api::get_settings).put(api::update_settings))
        .route("/usage", get(api::usage))
        .route("/admin/users", get(admin::list_users))
        .route("/admin/stats", get(admin::system_stats))
        .route(
            "/admin/users/:tenant_id",
            get(admin::user_details)
                .put(admin::update_user)
                .delete(admin::disable_user),
        )
}

fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/mailgun/inbound", post(handlers::mailgun_inbound))
        .route("/mailgun/events", post(handlers::mailgun_events))
        .route("/cloudflare/inbound", post(handlers::cloudflare_inbound))
        .route("/stripe", post(billing::stripe_webhook))
}

/// CORS for the configured origins only. An empty list allows none.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "cors_origin_invalid");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ])
        .max_age(Duration::from_secs(300))
}

fn security_header(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/info", get(handlers::info))
        .nest("/webhooks", webhook_routes())
        .nest("/api/v1", api_routes())
        .layer(cors)
        .layer(security_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .layer(security_header(header::X_FRAME_OPTIONS, "DENY"))
        .layer(security_header(header::X_XSS_PROTECTION, "1; mode=block"))
        .layer(security_header(
            header::REFERRER_POLICY,
            "strict-origin-when-cross-origin",
        ))
        .layer(security_header(
            HeaderName::from_static("permissions-policy"),
            "geolocation=(), microphone=(), camera=()",
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
