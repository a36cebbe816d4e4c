//! Persistence for tenants, settings, usage counters, audit logs and
//! delivery claims.
//!
//! Each concern is a narrow async trait so the pipeline and quota gate only
//! see the operations they are allowed to perform. [`SqliteStore`] implements
//! all of them.
//!
//! The only shared mutable row is the usage counter, and the only way to grow
//! it is [`UsageStore::try_increment`], a single conditional update.

pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use models::{
    tenant_key, truncate_preview, Direction, EmailLogEntry, EmailStatus, LogStats, NewTenant,
    Notifications, PlanTier, Role, SubscriptionStatus, Tenant, TenantSettings, TenantStats,
    TenantUpdate,
};
pub use sqlite::SqliteStore;

/// Errors raised by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing database could not serve the request.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tenant records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>>;

    /// Fetch the tenant for `new.email`, creating it when absent.
    ///
    /// An existing tenant is promoted when `new.role` is admin; other fields
    /// of an existing tenant are left as they are.
    async fn get_or_create_tenant(&self, new: &NewTenant) -> StoreResult<Tenant>;

    /// Apply a partial update. Returns `None` when the tenant does not exist.
    async fn update_tenant(
        &self,
        tenant_id: &str,
        update: &TenantUpdate,
    ) -> StoreResult<Option<Tenant>>;

    async fn list_tenants(&self, limit: i64, offset: i64) -> StoreResult<Vec<Tenant>>;

    async fn tenant_stats(&self) -> StoreResult<TenantStats>;
}

/// Per-tenant reply settings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_settings(&self, tenant_id: &str) -> StoreResult<Option<TenantSettings>>;

    async fn save_settings(&self, tenant_id: &str, settings: &TenantSettings) -> StoreResult<()>;
}

/// Monthly usage counters keyed by (tenant, `YYYY-MM`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Ensure the counter exists (created at 0) and return its value.
    /// Never changes an existing count.
    async fn touch(&self, tenant_id: &str, month: &str) -> StoreResult<i64>;

    /// Atomically add `amount` if the result stays within `limit`.
    ///
    /// Returns the new count, or `None` when the condition failed, the row
    /// does not exist, or `amount` is not positive. Nothing is written in
    /// the `None` case.
    async fn try_increment(
        &self,
        tenant_id: &str,
        month: &str,
        amount: i64,
        limit: i64,
    ) -> StoreResult<Option<i64>>;

    /// Read a counter without creating it.
    async fn get_usage(&self, tenant_id: &str, month: &str) -> StoreResult<Option<i64>>;

    /// Administrative reset to zero.
    async fn reset_usage(&self, tenant_id: &str, month: &str) -> StoreResult<()>;

    /// Sum of all tenants' counters for a month.
    async fn month_total(&self, month: &str) -> StoreResult<i64>;
}

/// Append-only audit log.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: &EmailLogEntry) -> StoreResult<()>;

    /// Most recent entries first.
    async fn recent(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<EmailLogEntry>>;

    async fn count_for_tenant(&self, tenant_id: &str) -> StoreResult<i64>;

    async fn count_all(&self) -> StoreResult<i64>;

    /// Counts for entries at or after `since` (RFC 3339).
    async fn stats_since(&self, tenant_id: &str, since: &str) -> StoreResult<LogStats>;
}

/// Claims on (tenant, Message-Id) pairs used to spot redelivered webhooks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    /// Returns `true` if this call created the claim, `false` if it existed.
    async fn claim(&self, tenant_id: &str, message_id: &str) -> StoreResult<bool>;

    async fn release(&self, tenant_id: &str, message_id: &str) -> StoreResult<()>;
}
