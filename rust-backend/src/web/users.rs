//! Login, profile and admin bootstrap.

use axum::{extract::State, http::HeaderMap, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{tenant_key, NewTenant, PlanTier, Role, SubscriptionStatus, Tenant, TenantStore};
use crate::web::session::{authenticate, require_admin};
use crate::web::{ApiError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// Public view of a tenant returned with a token.
#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub email: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    pub plan_tier: PlanTier,
    pub subscription_status: SubscriptionStatus,
    pub role: Role,
}

impl From<&Tenant> for UserSummary {
    fn from(t: &Tenant) -> Self {
        Self {
            email: t.email.clone(),
            tenant_id: t.tenant_id.clone(),
            plan_tier: t.plan_tier,
            subscription_status: t.subscription_status,
            role: t.role,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    pub token: String,
    pub user: UserSummary,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub status: &'static str,
    pub user: Tenant,
}

fn new_tenant(state: &AppState, request: &LoginRequest, role: Role) -> Result<NewTenant, ApiError> {
    let email = tenant_key(&request.email);
    if email.is_empty() {
        return Err(ApiError::BadRequest("email is required".to_string()));
    }

    Ok(NewTenant {
        email,
        name: request.name.trim().to_string(),
        role,
        monthly_quota: state.config.default_monthly_quota,
    })
}

/// `POST /api/v1/users/login`: exchange an email for a bearer token,
/// creating the tenant on first contact.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let new = new_tenant(&state, &request, Role::User)?;
    let tenant = state.store.get_or_create_tenant(&new).await?;
    let token = state.tokens.issue(&tenant)?;

    info!(tenant_id = %tenant.tenant_id, role = %tenant.role, "user_logged_in");

    Ok(Json(TokenResponse {
        status: "success",
        message: None,
        token,
        user: UserSummary::from(&tenant),
    }))
}

/// `GET /api/v1/users/profile`
pub async fn profile(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ProfileResponse>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    Ok(Json(ProfileResponse {
        status: "success",
        user: tenant,
    }))
}

/// `POST /api/v1/users/admin/create`: create or promote an admin. Only
/// existing admins may call it.
pub async fn create_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let caller = require_admin(&state, &headers).await?;

    let new = new_tenant(&state, &request, Role::Admin)?;
    let admin = state.store.get_or_create_tenant(&new).await?;
    let token = state.tokens.issue(&admin)?;

    info!(
        created_by = %caller.tenant_id,
        tenant_id = %admin.tenant_id,
        "admin_user_created"
    );

    Ok(Json(TokenResponse {
        status: "success",
        message: Some("Admin user created successfully"),
        token,
        user: UserSummary::from(&admin),
    }))
}
