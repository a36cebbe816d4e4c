//! Tenant-facing dashboard, logs, settings and usage routes.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::quota::{month_start, UsageSummary};
use crate::store::models::format_timestamp;
use crate::store::{AuditLog, EmailLogEntry, PlanTier, SettingsStore, SubscriptionStatus, TenantSettings};
use crate::web::session::authenticate;
use crate::web::{ApiError, ApiResponse, AppState};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Longest reply a tenant may ask for, in characters.
pub const MAX_REPLY_LENGTH: i64 = 5_000;

#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    /// `(limit, offset)` clamped to `1..=MAX_PAGE_SIZE` and `>= 0`.
    pub fn resolve(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize)]
pub struct PageInfo {
    pub limit: i64,
    pub offset: i64,
    pub total: i64,
    pub has_more: bool,
}

impl PageInfo {
    pub fn new(limit: i64, offset: i64, total: i64) -> Self {
        Self {
            limit,
            offset,
            total,
            has_more: offset + limit < total,
        }
    }
}

// =============================================================================
// Dashboard
// =============================================================================

fn plan_display_name(plan: PlanTier) -> &'static str {
    match plan {
        PlanTier::Starter => "Starter",
        PlanTier::Pro => "Pro",
        PlanTier::Business => "Business",
    }
}

#[derive(Debug, Serialize)]
pub struct PlanOverview {
    pub name: &'static str,
    pub monthly_limit: i64,
    pub current_usage: i64,
    pub remaining: i64,
}

#[derive(Debug, Serialize)]
pub struct MonthlyStats {
    pub sent: i64,
    pub received: i64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct DashboardOverview {
    pub plan: PlanOverview,
    pub status: SubscriptionStatus,
    pub last_email: Option<EmailLogEntry>,
    pub monthly_stats: MonthlyStats,
}

/// `GET /api/v1/dashboard/overview`
pub async fn dashboard_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<DashboardOverview>>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let tenant_id = tenant.tenant_id.as_str();

    let current_usage = state.pipeline.quota().current_usage(tenant_id).await?;
    let last_email = state.store.recent(tenant_id, 1, 0).await?.into_iter().next();
    let stats = state
        .store
        .stats_since(tenant_id, &month_start(Utc::now()))
        .await?;

    info!(tenant_id = %tenant_id, current_usage = current_usage, "dashboard_overview_served");

    Ok(Json(ApiResponse::new(DashboardOverview {
        plan: PlanOverview {
            name: plan_display_name(tenant.plan_tier),
            monthly_limit: tenant.monthly_quota,
            current_usage,
            remaining: (tenant.monthly_quota - current_usage).max(0),
        },
        status: tenant.subscription_status,
        last_email,
        monthly_stats: MonthlyStats {
            sent: stats.sent,
            received: stats.received,
            success_rate: stats.success_rate(),
        },
    })))
}

// =============================================================================
// Logs
// =============================================================================

#[derive(Debug, Serialize)]
pub struct LogsPage {
    pub logs: Vec<EmailLogEntry>,
    pub pagination: PageInfo,
}

/// `GET /api/v1/logs?limit&offset`, newest first.
pub async fn email_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Pagination>,
) -> Result<Json<ApiResponse<LogsPage>>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let (limit, offset) = page.resolve();

    let logs = state.store.recent(&tenant.tenant_id, limit, offset).await?;
    let total = state.store.count_for_tenant(&tenant.tenant_id).await?;

    Ok(Json(ApiResponse::new(LogsPage {
        logs,
        pagination: PageInfo::new(limit, offset, total),
    })))
}

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct NotificationsPatch {
    pub email: Option<bool>,
    pub slack: Option<bool>,
}

/// Partial settings update. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsPatch {
    pub tone: Option<String>,
    pub signature: Option<String>,
    pub max_length: Option<i64>,
    pub auto_reply_enabled: Option<bool>,
    pub notifications: Option<NotificationsPatch>,
}

impl SettingsPatch {
    /// Apply onto `settings`, returning the names of the fields written.
    pub fn apply(self, settings: &mut TenantSettings) -> Result<Vec<&'static str>, ApiError> {
        let mut updated = Vec::new();

        if let Some(tone) = self.tone {
            let tone = tone.trim();
            if tone.is_empty() {
                return Err(ApiError::BadRequest("tone must not be empty".to_string()));
            }
            settings.tone = tone.to_string();
            updated.push("tone");
        }
        if let Some(signature) = self.signature {
            settings.signature = signature;
            updated.push("signature");
        }
        if let Some(max_length) = self.max_length {
            if !(1..=MAX_REPLY_LENGTH).contains(&max_length) {
                return Err(ApiError::BadRequest(format!(
                    "max_length must be between 1 and {}",
                    MAX_REPLY_LENGTH
                )));
            }
            settings.max_length = max_length;
            updated.push("max_length");
        }
        if let Some(enabled) = self.auto_reply_enabled {
            settings.auto_reply_enabled = enabled;
            updated.push("auto_reply_enabled");
        }
        if let Some(notifications) = self.notifications {
            if let Some(email) = notifications.email {
                settings.notifications.email = email;
                updated.push("notifications.email");
            }
            if let Some(slack) = notifications.slack {
                settings.notifications.slack = slack;
                updated.push("notifications.slack");
            }
        }

        Ok(updated)
    }
}

/// `GET /api/v1/settings`
pub async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<TenantSettings>>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let settings = state
        .store
        .get_settings(&tenant.tenant_id)
        .await?
        .unwrap_or_default();
    Ok(Json(ApiResponse::new(settings)))
}

#[derive(Debug, Serialize)]
pub struct SettingsUpdated {
    pub status: &'static str,
    pub message: &'static str,
    pub updated_fields: Vec<&'static str>,
    pub data: TenantSettings,
    pub timestamp: String,
}

/// `PUT /api/v1/settings`
pub async fn update_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<SettingsUpdated>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;

    let mut settings = state
        .store
        .get_settings(&tenant.tenant_id)
        .await?
        .unwrap_or_default();

    let updated_fields = patch.apply(&mut settings)?;
    if updated_fields.is_empty() {
        return Err(ApiError::BadRequest("No valid fields to update".to_string()));
    }

    state.store.save_settings(&tenant.tenant_id, &settings).await?;

    info!(
        tenant_id = %tenant.tenant_id,
        updated_fields = ?updated_fields,
        "settings_updated"
    );

    Ok(Json(SettingsUpdated {
        status: "success",
        message: "Settings updated successfully",
        updated_fields,
        data: settings,
        timestamp: format_timestamp(Utc::now()),
    }))
}

// =============================================================================
// Usage
// =============================================================================

/// `GET /api/v1/usage`
pub async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<UsageSummary>>, ApiError> {
    let tenant = authenticate(&state, &headers).await?;
    let summary = state.pipeline.quota().usage_summary(&tenant.tenant_id).await?;
    Ok(Json(ApiResponse::new(summary)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults_and_clamps() {
        assert_eq!(Pagination::default().resolve(), (50, 0));
        assert_eq!(
            Pagination {
                limit: Some(1_000),
                offset: Some(-5)
            }
            .resolve(),
            (100, 0)
        );
        assert_eq!(
            Pagination {
                limit: Some(0),
                offset: Some(10)
            }
            .resolve(),
            (1, 10)
        );
    }

    #[test]
    fn test_page_info_has_more() {
        assert!(PageInfo::new(10, 0, 11).has_more);
        assert!(!PageInfo::new(10, 10, 20).has_more);
    }

    #[test]
    fn test_settings_patch_is_partial() {
        let mut settings = TenantSettings::default();
        let patch: SettingsPatch = serde_json::from_value(serde_json::json!({
            "tone": "friendly",
            "notifications": {"slack": true},
            "unknown": 1,
        }))
        .unwrap();

        let updated = patch.apply(&mut settings).unwrap();

        assert_eq!(updated, vec!["tone", "notifications.slack"]);
        assert_eq!(settings.tone, "friendly");
        assert!(settings.notifications.slack);
        assert!(settings.notifications.email);
        assert_eq!(settings.max_length, 700);
    }

    #[test]
    fn test_settings_patch_rejects_bad_values() {
        let mut settings = TenantSettings::default();
        let patch = SettingsPatch {
            max_length: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            patch.apply(&mut settings),
            Err(ApiError::BadRequest(_))
        ));

        let patch = SettingsPatch {
            tone: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.apply(&mut settings),
            Err(ApiError::BadRequest(_))
        ));
    }
}
