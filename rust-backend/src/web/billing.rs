//! Stripe webhook: billing events update tenant plan and status.
//!
//! Events are read as loosely typed JSON. Only the handful of fields that
//! drive tenant state are looked at; anything else is acknowledged and
//! ignored.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::store::models::format_timestamp;
use crate::store::{
    tenant_key, NewTenant, PlanTier, Role, SubscriptionStatus, TenantStore, TenantUpdate,
};
use crate::web::signature::{required_secret, verify_stripe_signature, SignatureError};
use crate::web::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// What an event asks of the tenant store.
#[derive(Debug, Clone, PartialEq)]
pub struct BillingChange {
    pub tenant_id: String,
    pub name: String,
    /// Create the tenant when it does not exist yet
    pub create: bool,
    pub update: TenantUpdate,
}

fn metadata_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .get("metadata")
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn str_at<'a>(object: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut current = object;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Tenant key from `metadata.tenant_id`, `customer_email` or
/// `customer_details.email`, in that order.
pub fn resolve_tenant(object: &Value) -> Option<String> {
    metadata_str(object, "tenant_id")
        .or_else(|| str_at(object, &["customer_email"]))
        .or_else(|| str_at(object, &["customer_details", "email"]))
        .map(tenant_key)
        .filter(|k| !k.is_empty())
}

fn plan_from_metadata(object: &Value) -> Option<PlanTier> {
    let raw = metadata_str(object, "plan_tier").or_else(|| metadata_str(object, "plan"))?;
    match raw.to_ascii_lowercase().parse() {
        Ok(plan) => Some(plan),
        Err(e) => {
            warn!(plan = %raw, error = %e, "stripe_unknown_plan");
            None
        }
    }
}

/// Map a Stripe subscription status onto ours. Transitional states map to
/// nothing.
pub fn map_subscription_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" => Some(SubscriptionStatus::Active),
        "trialing" => Some(SubscriptionStatus::Trial),
        "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
        "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        _ => None,
    }
}

fn with_plan(mut update: TenantUpdate, plan: Option<PlanTier>) -> TenantUpdate {
    if let Some(plan) = plan {
        update.plan_tier = Some(plan);
        update.monthly_quota = Some(plan.default_quota());
    }
    update
}

/// Translate an event into a tenant change. `None` for events that carry no
/// billing meaning for us or name no tenant.
pub fn billing_change(event: &StripeEvent) -> Option<BillingChange> {
    let object = &event.data.object;

    let (create, update) = match event.event_type.as_str() {
        "checkout.session.completed" => (
            true,
            with_plan(
                TenantUpdate {
                    subscription_status: Some(SubscriptionStatus::Active),
                    ..Default::default()
                },
                plan_from_metadata(object),
            ),
        ),
        "customer.subscription.created" | "customer.subscription.updated" => {
            let status = str_at(object, &["status"]).and_then(map_subscription_status);
            let update = with_plan(
                TenantUpdate {
                    subscription_status: status,
                    ..Default::default()
                },
                plan_from_metadata(object),
            );
            (false, update)
        }
        "customer.subscription.deleted" => (
            false,
            TenantUpdate {
                subscription_status: Some(SubscriptionStatus::Canceled),
                ..Default::default()
            },
        ),
        "invoice.payment_failed" => (
            false,
            TenantUpdate {
                subscription_status: Some(SubscriptionStatus::PastDue),
                ..Default::default()
            },
        ),
        "invoice.paid" => (
            false,
            TenantUpdate {
                subscription_status: Some(SubscriptionStatus::Active),
                ..Default::default()
            },
        ),
        _ => return None,
    };

    if update.is_empty() {
        return None;
    }

    let tenant_id = resolve_tenant(object)?;
    let name = str_at(object, &["customer_details", "name"])
        .or_else(|| metadata_str(object, "name"))
        .unwrap_or_default()
        .to_string();

    Some(BillingChange {
        tenant_id,
        name,
        create,
        update,
    })
}

#[derive(Serialize)]
pub struct StripeAck {
    pub status: &'static str,
    pub event_type: String,
    pub handled: bool,
    pub timestamp: String,
}

/// `POST /webhooks/stripe`
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StripeAck>, ApiError> {
    let secret = required_secret(
        "stripe",
        state.config.stripe_webhook_secret.as_deref(),
        state.config.strict_signature_check,
    )?;

    if let Some(secret) = secret {
        let header = headers
            .get("Stripe-Signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(SignatureError::MissingFields)?;
        verify_stripe_signature(secret, header, &body, state.config.stripe_signature_tolerance)?;
    }

    let event: StripeEvent = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, payload_size = body.len(), "stripe_payload_invalid");
        ApiError::BadRequest("invalid event payload".to_string())
    })?;

    info!(
        event_id = %event.id,
        event_type = %event.event_type,
        payload_size = body.len(),
        "stripe_webhook_received"
    );

    let handled = match billing_change(&event) {
        Some(change) => apply_change(&state, &change).await?,
        None => {
            info!(event_type = %event.event_type, "stripe_event_ignored");
            false
        }
    };

    Ok(Json(StripeAck {
        status: "received",
        event_type: event.event_type,
        handled,
        timestamp: format_timestamp(Utc::now()),
    }))
}

async fn apply_change(state: &AppState, change: &BillingChange) -> Result<bool, ApiError> {
    if change.create {
        state
            .store
            .get_or_create_tenant(&NewTenant {
                email: change.tenant_id.clone(),
                name: change.name.clone(),
                role: Role::User,
                monthly_quota: state.config.default_monthly_quota,
            })
            .await?;
    }

    match state.store.update_tenant(&change.tenant_id, &change.update).await? {
        Some(tenant) => {
            info!(
                tenant_id = %tenant.tenant_id,
                plan_tier = %tenant.plan_tier,
                subscription_status = %tenant.subscription_status,
                monthly_quota = tenant.monthly_quota,
                "tenant_billing_updated"
            );
            Ok(true)
        }
        None => {
            warn!(tenant_id = %change.tenant_id, "stripe_event_unknown_tenant");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, object: Value) -> StripeEvent {
        StripeEvent {
            id: "evt_1".to_string(),
            event_type: event_type.to_string(),
            data: StripeEventData { object },
        }
    }

    #[test]
    fn test_resolve_tenant_precedence() {
        let object = json!({
            "metadata": {"tenant_id": "Owner@Example.com"},
            "customer_email": "billing@example.com",
        });
        assert_eq!(resolve_tenant(&object).as_deref(), Some("owner@example.com"));

        let object = json!({"customer_details": {"email": "D@Example.com"}});
        assert_eq!(resolve_tenant(&object).as_deref(), Some("d@example.com"));

        assert_eq!(resolve_tenant(&json!({"metadata": {}})), None);
    }

    #[test]
    fn test_checkout_completed_sets_plan_and_quota() {
        let change = billing_change(&event(
            "checkout.session.completed",
            json!({
                "customer_details": {"email": "a@example.com", "name": "A"},
                "metadata": {"plan_tier": "Pro"},
            }),
        ))
        .unwrap();

        assert!(change.create);
        assert_eq!(change.tenant_id, "a@example.com");
        assert_eq!(change.name, "A");
        assert_eq!(change.update.plan_tier, Some(PlanTier::Pro));
        assert_eq!(change.update.monthly_quota, Some(1_000));
        assert_eq!(
            change.update.subscription_status,
            Some(SubscriptionStatus::Active)
        );
    }

    #[test]
    fn test_subscription_status_mapping() {
        let change = billing_change(&event(
            "customer.subscription.updated",
            json!({"status": "past_due", "metadata": {"tenant_id": "a@example.com"}}),
        ))
        .unwrap();
        assert!(!change.create);
        assert_eq!(
            change.update.subscription_status,
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(change.update.plan_tier, None);

        // Transitional status with no plan: nothing to do
        assert!(billing_change(&event(
            "customer.subscription.updated",
            json!({"status": "incomplete", "metadata": {"tenant_id": "a@example.com"}}),
        ))
        .is_none());
    }

    #[test]
    fn test_invoice_and_deletion_events() {
        let object = json!({"customer_email": "a@example.com"});

        let failed = billing_change(&event("invoice.payment_failed", object.clone())).unwrap();
        assert_eq!(
            failed.update.subscription_status,
            Some(SubscriptionStatus::PastDue)
        );

        let paid = billing_change(&event("invoice.paid", object.clone())).unwrap();
        assert_eq!(paid.update.subscription_status, Some(SubscriptionStatus::Active));

        let deleted = billing_change(&event("customer.subscription.deleted", object)).unwrap();
        assert_eq!(
            deleted.update.subscription_status,
            Some(SubscriptionStatus::Canceled)
        );
    }

    #[test]
    fn test_unknown_event_or_tenant_is_ignored() {
        assert!(billing_change(&event("charge.refunded", json!({}))).is_none());
        assert!(billing_change(&event("invoice.paid", json!({}))).is_none());
    }
}
