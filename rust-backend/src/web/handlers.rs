//! Health and inbound email webhook handlers.
//!
//! Inbound handlers verify the caller, normalize the provider payload into an
//! [`InboundEmail`](crate::inbound::InboundEmail) and hand it to the pipeline.
//! The response body is the pipeline outcome.

use axum::{
    extract::{Form, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::inbound::{CloudflarePayload, InboundEmail, MailgunEventForm, MailgunInboundForm};
use crate::pipeline::ReplyOutcome;
use crate::store::models::format_timestamp;
use crate::store::tenant_key;
use crate::web::signature::{
    required_secret, verify_mailgun_signature, verify_shared_token,
};
use crate::web::{ApiError, AppState};

pub const SERVICE_NAME: &str = "replymint-backend";

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
}

/// Liveness. Touches nothing.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: format_timestamp(Utc::now()),
        service: SERVICE_NAME,
    })
}

#[derive(Serialize)]
pub struct ReadyChecks {
    pub database: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
    pub environment: String,
    pub checks: ReadyChecks,
}

/// Readiness: `ready` when the store answers, `degraded` with 503 otherwise.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.store.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            warn!(error = %e, "readiness_database_unhealthy");
            "unhealthy"
        }
    };

    let (code, status) = if database == "healthy" {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(ReadyResponse {
            status,
            timestamp: format_timestamp(Utc::now()),
            service: SERVICE_NAME,
            environment: state.config.environment.clone(),
            checks: ReadyChecks { database },
        }),
    )
}

#[derive(Serialize)]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub environment: String,
}

pub async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: "ReplyMint Backend",
        version: env!("CARGO_PKG_VERSION"),
        environment: state.config.environment.clone(),
    })
}

// =============================================================================
// Mailgun
// =============================================================================

fn check_mailgun_signature(
    state: &AppState,
    timestamp: &str,
    token: &str,
    signature: &str,
) -> Result<(), ApiError> {
    let config = &state.config;
    let key = required_secret(
        "mailgun",
        config.mailgun_signing_key.as_deref(),
        config.strict_signature_check,
    )?;

    if let Some(key) = key {
        verify_mailgun_signature(
            key,
            timestamp,
            token,
            signature,
            config.mailgun_signature_max_age,
        )?;
    }

    Ok(())
}

/// Reject recipients outside the configured receiving domain.
fn check_recipient_domain(state: &AppState, recipient: &str) -> Result<(), ApiError> {
    let Some(domain) = &state.config.mailgun_domain else {
        return Ok(());
    };

    if !tenant_key(recipient).ends_with(&format!("@{}", domain.to_lowercase())) {
        warn!(
            recipient = %recipient,
            expected_domain = %domain,
            "mailgun_invalid_recipient_domain"
        );
        return Err(ApiError::BadRequest(format!(
            "recipient must be an address at {}",
            domain
        )));
    }

    Ok(())
}

/// `POST /webhooks/mailgun/inbound`
pub async fn mailgun_inbound(
    State(state): State<AppState>,
    Form(form): Form<MailgunInboundForm>,
) -> Result<Json<ReplyOutcome>, ApiError> {
    info!(
        recipient = %form.recipient(),
        sender = %form.sender,
        has_body_plain = form.body_plain.is_some(),
        has_signature = !form.signature.is_empty(),
        "mailgun_webhook_received"
    );

    check_mailgun_signature(&state, &form.timestamp, &form.token, &form.signature)?;

    if form.recipient().trim().is_empty() {
        warn!("mailgun_missing_recipient");
        return Err(ApiError::BadRequest("recipient is required".to_string()));
    }

    check_recipient_domain(&state, form.recipient())?;

    run_pipeline(&state, form.into_email()).await
}

#[derive(Serialize)]
pub struct EventAck {
    pub status: &'static str,
    pub timestamp: String,
}

/// `POST /webhooks/mailgun/events`: delivery events are logged only.
pub async fn mailgun_events(
    State(state): State<AppState>,
    Form(form): Form<MailgunEventForm>,
) -> Result<Json<EventAck>, ApiError> {
    check_mailgun_signature(&state, &form.timestamp, &form.token, &form.signature)?;

    info!(
        event = %form.event,
        message_id = ?form.message_id,
        recipient = %form.recipient,
        "mailgun_event_received"
    );

    Ok(Json(EventAck {
        status: "received",
        timestamp: format_timestamp(Utc::now()),
    }))
}

// =============================================================================
// Cloudflare
// =============================================================================

/// `POST /webhooks/cloudflare/inbound`
pub async fn cloudflare_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CloudflarePayload>,
) -> Result<Json<ReplyOutcome>, ApiError> {
    info!(
        from = %payload.from_field,
        to = %payload.to,
        raw_content_length = payload.raw_content.len(),
        "cloudflare_webhook_received"
    );

    let expected = required_secret(
        "cloudflare",
        state.config.cloudflare_auth_token.as_deref(),
        state.config.strict_signature_check,
    )?;

    if let Some(expected) = expected {
        let provided = headers
            .get("X-Custom-Auth")
            .and_then(|v| v.to_str().ok());
        verify_shared_token(expected, provided).map_err(|e| {
            warn!(to = %payload.to, error = %e, "cloudflare_auth_invalid");
            e
        })?;
    }

    if payload.to.trim().is_empty() {
        warn!("cloudflare_missing_recipient");
        return Err(ApiError::BadRequest("recipient is required".to_string()));
    }

    run_pipeline(&state, payload.into_email()).await
}

async fn run_pipeline(state: &AppState, email: InboundEmail) -> Result<Json<ReplyOutcome>, ApiError> {
    let outcome = state.pipeline.handle(email).await?;
    Ok(Json(outcome))
}
