//! Monthly quota enforcement.
//!
//! The gate decides whether an event may consume usage units. The only write
//! it performs is the store's conditional increment, so a denied reservation
//! leaves the counter exactly as it found it.

use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::store::models::format_timestamp;
use crate::store::{StoreResult, TenantStore, UsageStore};

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub admitted: bool,
    /// Counter value after the attempt
    pub usage: i64,
    pub quota: i64,
}

/// Counter key for the calendar month containing `at`, e.g. `2026-10`.
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}

/// Keys for the `count` months ending with the one containing `at`, newest first.
pub fn recent_month_keys(at: DateTime<Utc>, count: usize) -> Vec<String> {
    let mut year = at.year();
    let mut month = at.month();
    let mut keys = Vec::with_capacity(count);

    for _ in 0..count {
        keys.push(format!("{:04}-{:02}", year, month));
        if month == 1 {
            month = 12;
            year -= 1;
        } else {
            month -= 1;
        }
    }

    keys
}

/// First instant of the month containing `at`, formatted like audit timestamps.
pub fn month_start(at: DateTime<Utc>) -> String {
    let start = Utc
        .with_ymd_and_hms(at.year(), at.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(at);
    format_timestamp(start)
}

// =============================================================================
// Usage summary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    None,
    Notice,
    Warning,
    Critical,
    Exceeded,
}

impl WarningLevel {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage >= 100.0 {
            WarningLevel::Exceeded
        } else if percentage >= 90.0 {
            WarningLevel::Critical
        } else if percentage >= 80.0 {
            WarningLevel::Warning
        } else if percentage >= 60.0 {
            WarningLevel::Notice
        } else {
            WarningLevel::None
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, WarningLevel::Critical | WarningLevel::Exceeded)
    }

    /// Human-readable message, if this level warrants one.
    pub fn message(&self, usage: i64, quota: i64, percentage: f64) -> Option<String> {
        match self {
            WarningLevel::None => None,
            WarningLevel::Notice => Some(format!(
                "Notice: You've used {:.1}% of your monthly quota ({}/{}).",
                percentage, usage, quota
            )),
            WarningLevel::Warning => Some(format!(
                "Warning: You're at {:.1}% of your monthly quota ({}/{}).",
                percentage, usage, quota
            )),
            WarningLevel::Critical => Some(format!(
                "Critical: You're at {:.1}% of your monthly quota ({}/{}).",
                percentage, usage, quota
            )),
            WarningLevel::Exceeded => Some(format!(
                "Monthly quota exceeded! You've used {}/{} emails.",
                usage, quota
            )),
        }
    }
}

/// Percentage of `quota` consumed; zero when the quota is zero.
pub fn usage_percentage(usage: i64, quota: i64) -> f64 {
    if quota > 0 {
        usage as f64 / quota as f64 * 100.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMonthUsage {
    pub month: String,
    pub usage: i64,
    pub quota: i64,
    pub remaining: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaWarnings {
    pub warning_level: WarningLevel,
    pub usage_percentage: f64,
    pub current_usage: i64,
    pub quota: i64,
    pub remaining: i64,
    pub warnings: Vec<String>,
    pub is_critical: bool,
}

impl QuotaWarnings {
    pub fn new(usage: i64, quota: i64) -> Self {
        let percentage = usage_percentage(usage, quota);
        let level = WarningLevel::from_percentage(percentage);

        Self {
            warning_level: level,
            usage_percentage: percentage,
            current_usage: usage,
            quota,
            remaining: (quota - usage).max(0),
            warnings: level.message(usage, quota, percentage).into_iter().collect(),
            is_critical: level.is_critical(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthUsage {
    pub month: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSummary {
    pub current_month: CurrentMonthUsage,
    pub warnings: QuotaWarnings,
    /// Months with a counter, newest first
    pub history: Vec<MonthUsage>,
    /// `active` while admission is still possible, else `quota_exceeded`
    pub status: &'static str,
}

// =============================================================================
// Gate
// =============================================================================

/// Quota gate over the tenant and usage stores.
#[derive(Clone)]
pub struct QuotaGate {
    tenants: Arc<dyn TenantStore>,
    usage: Arc<dyn UsageStore>,
    default_quota: i64,
}

impl QuotaGate {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        usage: Arc<dyn UsageStore>,
        default_quota: i64,
    ) -> Self {
        Self {
            tenants,
            usage,
            default_quota,
        }
    }

    /// Quota for a tenant, or the configured default when it has no record.
    pub async fn quota_for(&self, tenant_id: &str) -> StoreResult<i64> {
        Ok(self
            .tenants
            .get_tenant(tenant_id)
            .await?
            .map(|t| t.monthly_quota)
            .unwrap_or(self.default_quota))
    }

    /// Reserve `amount` units for the current month.
    pub async fn check_and_reserve(&self, tenant_id: &str, amount: u32) -> StoreResult<Reservation> {
        self.check_and_reserve_for(tenant_id, &month_key(Utc::now()), amount)
            .await
    }

    /// Reserve `amount` units against an explicit month key.
    ///
    /// `amount == 0` only creates the counter when missing. The amount is
    /// unsigned so a reservation can never lower the counter.
    pub async fn check_and_reserve_for(
        &self,
        tenant_id: &str,
        month: &str,
        amount: u32,
    ) -> StoreResult<Reservation> {
        let amount = i64::from(amount);
        let quota = self.quota_for(tenant_id).await?;
        let current = self.usage.touch(tenant_id, month).await?;

        if current + amount > quota {
            info!(
                tenant_id = %tenant_id,
                month = %month,
                current = current,
                quota = quota,
                "quota_exceeded"
            );
            return Ok(Reservation {
                admitted: false,
                usage: current,
                quota,
            });
        }

        if amount == 0 {
            return Ok(Reservation {
                admitted: true,
                usage: current,
                quota,
            });
        }

        match self
            .usage
            .try_increment(tenant_id, month, amount, quota)
            .await?
        {
            Some(usage) => Ok(Reservation {
                admitted: true,
                usage,
                quota,
            }),
            None => {
                // Lost the race for the remaining units.
                let usage = self
                    .usage
                    .get_usage(tenant_id, month)
                    .await?
                    .unwrap_or(current);
                warn!(
                    tenant_id = %tenant_id,
                    month = %month,
                    usage = usage,
                    quota = quota,
                    "quota_reservation_lost_race"
                );
                Ok(Reservation {
                    admitted: false,
                    usage,
                    quota,
                })
            }
        }
    }

    /// Current-month usage without creating a counter.
    pub async fn current_usage(&self, tenant_id: &str) -> StoreResult<i64> {
        Ok(self
            .usage
            .get_usage(tenant_id, &month_key(Utc::now()))
            .await?
            .unwrap_or(0))
    }

    /// Administrative reset of the current month's counter.
    pub async fn reset_current_month(&self, tenant_id: &str) -> StoreResult<()> {
        self.usage
            .reset_usage(tenant_id, &month_key(Utc::now()))
            .await
    }

    /// Counters for the last `months` months, newest first, skipping months
    /// without a counter.
    pub async fn usage_history(&self, tenant_id: &str, months: usize) -> StoreResult<Vec<MonthUsage>> {
        let mut history = Vec::new();
        for month in recent_month_keys(Utc::now(), months) {
            if let Some(count) = self.usage.get_usage(tenant_id, &month).await? {
                history.push(MonthUsage { month, count });
            }
        }
        Ok(history)
    }

    /// Current usage, warning level and three months of history.
    pub async fn usage_summary(&self, tenant_id: &str) -> StoreResult<UsageSummary> {
        let month = month_key(Utc::now());
        let reservation = self.check_and_reserve_for(tenant_id, &month, 0).await?;
        let history = self.usage_history(tenant_id, 3).await?;

        let warnings = QuotaWarnings::new(reservation.usage, reservation.quota);

        info!(
            tenant_id = %tenant_id,
            usage = reservation.usage,
            quota = reservation.quota,
            warning_level = ?warnings.warning_level,
            "usage_summary_built"
        );

        Ok(UsageSummary {
            current_month: CurrentMonthUsage {
                month,
                usage: reservation.usage,
                quota: reservation.quota,
                remaining: warnings.remaining,
                percentage: warnings.usage_percentage,
            },
            warnings,
            history,
            status: if reservation.admitted {
                "active"
            } else {
                "quota_exceeded"
            },
        })
    }
}
