//! Admin-only tenant management.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::quota::{month_key, MonthUsage};
use crate::store::models::format_timestamp;
use crate::store::{
    tenant_key, AuditLog, EmailLogEntry, PlanTier, Role, SettingsStore, SubscriptionStatus,
    Tenant, TenantSettings, TenantStats, TenantStore, TenantUpdate, UsageStore,
};
use crate::web::api::{PageInfo, Pagination};
use crate::web::session::require_admin;
use crate::web::{ApiError, ApiResponse, AppState};

const USAGE_HISTORY_MONTHS: usize = 6;
const RECENT_EMAILS: i64 = 10;

#[derive(Debug, Serialize)]
pub struct TenantWithUsage {
    #[serde(flatten)]
    pub tenant: Tenant,
    pub current_month_usage: i64,
}

#[derive(Debug, Serialize)]
pub struct UsersPage {
    pub users: Vec<TenantWithUsage>,
    pub pagination: PageInfo,
}

/// `GET /api/v1/admin/users?limit&offset`
pub async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Pagination>,
) -> Result<Json<ApiResponse<UsersPage>>, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    let (limit, offset) = page.resolve();
    let month = month_key(Utc::now());

    let tenants = state.store.list_tenants(limit, offset).await?;
    let total = state.store.tenant_stats().await?.total;

    let mut users = Vec::with_capacity(tenants.len());
    for tenant in tenants {
        let current_month_usage = state
            .store
            .get_usage(&tenant.tenant_id, &month)
            .await?
            .unwrap_or(0);
        users.push(TenantWithUsage {
            tenant,
            current_month_usage,
        });
    }

    info!(
        admin_user = %admin.tenant_id,
        limit = limit,
        offset = offset,
        returned = users.len(),
        "admin_users_listed"
    );

    Ok(Json(ApiResponse::new(UsersPage {
        users,
        pagination: PageInfo::new(limit, offset, total),
    })))
}

#[derive(Debug, Serialize)]
pub struct UsageTotals {
    pub current_month: i64,
    pub total_processed: i64,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub environment: String,
}

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub users: TenantStats,
    pub usage: UsageTotals,
    pub system: SystemInfo,
}

/// `GET /api/v1/admin/stats`
pub async fn system_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<SystemStats>>, ApiError> {
    let admin = require_admin(&state, &headers).await?;

    let users = state.store.tenant_stats().await?;
    let current_month = state.store.month_total(&month_key(Utc::now())).await?;
    let total_processed = state.store.count_all().await?;

    info!(admin_user = %admin.tenant_id, "admin_stats_requested");

    Ok(Json(ApiResponse::new(SystemStats {
        users,
        usage: UsageTotals {
            current_month,
            total_processed,
        },
        system: SystemInfo {
            environment: state.config.environment.clone(),
        },
    })))
}

#[derive(Debug, Serialize)]
pub struct TenantDetail {
    pub user: Tenant,
    pub settings: TenantSettings,
    pub usage_history: Vec<MonthUsage>,
    pub recent_emails: Vec<EmailLogEntry>,
}

async fn load_tenant(state: &AppState, tenant_id: &str) -> Result<Tenant, ApiError> {
    state
        .store
        .get_tenant(&tenant_key(tenant_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

/// `GET /api/v1/admin/users/:tenant_id`
pub async fn user_details(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<ApiResponse<TenantDetail>>, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    let user = load_tenant(&state, &tenant_id).await?;

    let settings = state
        .store
        .get_settings(&user.tenant_id)
        .await?
        .unwrap_or_default();
    let usage_history = state
        .pipeline
        .quota()
        .usage_history(&user.tenant_id, USAGE_HISTORY_MONTHS)
        .await?;
    let recent_emails = state.store.recent(&user.tenant_id, RECENT_EMAILS, 0).await?;

    info!(
        admin_user = %admin.tenant_id,
        target_user = %user.tenant_id,
        "admin_user_details_requested"
    );

    Ok(Json(ApiResponse::new(TenantDetail {
        user,
        settings,
        usage_history,
        recent_emails,
    })))
}

/// Fields an administrator may change. Anything else in the body is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct AdminUserUpdate {
    pub plan_tier: Option<PlanTier>,
    pub monthly_quota: Option<i64>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub role: Option<Role>,
    pub auto_reply_enabled: Option<bool>,
}

impl AdminUserUpdate {
    fn tenant_update(&self) -> TenantUpdate {
        TenantUpdate {
            plan_tier: self.plan_tier,
            monthly_quota: self.monthly_quota,
            subscription_status: self.subscription_status,
            role: self.role,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdminMessage {
    pub status: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_fields: Vec<&'static str>,
    pub timestamp: String,
}

async fn set_auto_reply(state: &AppState, tenant_id: &str, enabled: bool) -> Result<(), ApiError> {
    let mut settings = state
        .store
        .get_settings(tenant_id)
        .await?
        .unwrap_or_default();
    settings.auto_reply_enabled = enabled;
    state.store.save_settings(tenant_id, &settings).await?;
    Ok(())
}

/// `PUT /api/v1/admin/users/:tenant_id`
///
/// A quota change resets the current month's counter to zero.
pub async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Json(body): Json<AdminUserUpdate>,
) -> Result<Json<AdminMessage>, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    let user = load_tenant(&state, &tenant_id).await?;

    if matches!(body.monthly_quota, Some(q) if q < 0) {
        return Err(ApiError::BadRequest(
            "monthly_quota must be zero or greater".to_string(),
        ));
    }

    let update = body.tenant_update();
    let mut updated_fields = update.field_names();
    if body.auto_reply_enabled.is_some() {
        updated_fields.push("auto_reply_enabled");
    }
    if updated_fields.is_empty() {
        return Err(ApiError::BadRequest("No valid fields to update".to_string()));
    }

    if !update.is_empty() {
        state
            .store
            .update_tenant(&user.tenant_id, &update)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    }

    if let Some(enabled) = body.auto_reply_enabled {
        set_auto_reply(&state, &user.tenant_id, enabled).await?;
    }

    if update.monthly_quota.is_some() {
        state.pipeline.quota().reset_current_month(&user.tenant_id).await?;
        info!(tenant_id = %user.tenant_id, "usage_reset_after_quota_change");
    }

    info!(
        admin_user = %admin.tenant_id,
        target_user = %user.tenant_id,
        updated_fields = ?updated_fields,
        "admin_user_updated"
    );

    Ok(Json(AdminMessage {
        status: "success",
        message: "User updated successfully",
        updated_fields,
        timestamp: format_timestamp(Utc::now()),
    }))
}

/// `DELETE /api/v1/admin/users/:tenant_id`: tenants are disabled, never removed.
pub async fn disable_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Result<Json<AdminMessage>, ApiError> {
    let admin = require_admin(&state, &headers).await?;
    let user = load_tenant(&state, &tenant_id).await?;

    let update = TenantUpdate {
        subscription_status: Some(SubscriptionStatus::Disabled),
        ..Default::default()
    };
    state.store.update_tenant(&user.tenant_id, &update).await?;
    set_auto_reply(&state, &user.tenant_id, false).await?;

    info!(
        admin_user = %admin.tenant_id,
        target_user = %user.tenant_id,
        "admin_user_disabled"
    );

    Ok(Json(AdminMessage {
        status: "success",
        message: "User disabled successfully",
        updated_fields: Vec::new(),
        timestamp: format_timestamp(Utc::now()),
    }))
}
