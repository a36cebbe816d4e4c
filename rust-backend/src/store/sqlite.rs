//! SQLite implementation of every store trait.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use super::models::{
    format_timestamp, EmailLogEntry, LogStats, NewTenant, Role, Tenant, TenantSettings,
    TenantStats, TenantUpdate,
};
use super::{
    AuditLog, DeliveryLedger, SettingsStore, StoreError, StoreResult, TenantStore, UsageStore,
};

/// SQLite-backed store shared by the web server and the sender worker.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database at `url` and run migrations.
    pub async fn open(url: &str, max_connections: u32) -> StoreResult<Self> {
        if url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        info!(url = %url, max_connections = max_connections, "store_opened");

        Ok(store)
    }

    /// Private in-memory database. A single connection that never expires
    /// keeps the data alive for the life of the pool.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Cheap round trip used by the readiness probe.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL,
                plan_tier TEXT NOT NULL,
                monthly_quota INTEGER NOT NULL CHECK (monthly_quota >= 0),
                subscription_status TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_settings (
                tenant_id TEXT PRIMARY KEY,
                tone TEXT NOT NULL,
                signature TEXT NOT NULL,
                max_length INTEGER NOT NULL,
                auto_reply_enabled INTEGER NOT NULL,
                notify_email INTEGER NOT NULL,
                notify_slack INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_counters (
                tenant_id TEXT NOT NULL,
                month TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, month)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS email_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                direction TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                subject TEXT NOT NULL,
                status TEXT NOT NULL,
                reply_preview TEXT NOT NULL,
                message_id TEXT,
                delivery_id TEXT,
                usage_count INTEGER,
                usage_quota INTEGER,
                ai_tokens_used INTEGER,
                cost_usd REAL,
                error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_email_logs_tenant_time ON email_logs(tenant_id, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_claims (
                tenant_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                claimed_at INTEGER NOT NULL,
                PRIMARY KEY (tenant_id, message_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Tenant::try_from).transpose()
    }
}

fn now_secs() -> i64 {
    Utc::now().timestamp()
}

fn decode<T: FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(StoreError::Corrupt)
}

// ==================== Row types ====================

#[derive(sqlx::FromRow)]
struct TenantRow {
    tenant_id: String,
    email: String,
    name: String,
    plan_tier: String,
    monthly_quota: i64,
    subscription_status: String,
    role: String,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = StoreError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            tenant_id: row.tenant_id,
            email: row.email,
            name: row.name,
            plan_tier: decode(&row.plan_tier)?,
            monthly_quota: row.monthly_quota,
            subscription_status: decode(&row.subscription_status)?,
            role: decode(&row.role)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SettingsRow {
    tone: String,
    signature: String,
    max_length: i64,
    auto_reply_enabled: bool,
    notify_email: bool,
    notify_slack: bool,
}

impl From<SettingsRow> for TenantSettings {
    fn from(row: SettingsRow) -> Self {
        TenantSettings {
            tone: row.tone,
            signature: row.signature,
            max_length: row.max_length,
            auto_reply_enabled: row.auto_reply_enabled,
            notifications: super::Notifications {
                email: row.notify_email,
                slack: row.notify_slack,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    tenant_id: String,
    created_at: String,
    direction: String,
    from_addr: String,
    to_addr: String,
    subject: String,
    status: String,
    reply_preview: String,
    message_id: Option<String>,
    delivery_id: Option<String>,
    usage_count: Option<i64>,
    usage_quota: Option<i64>,
    ai_tokens_used: Option<i64>,
    cost_usd: Option<f64>,
    error: Option<String>,
}

impl TryFrom<LogRow> for EmailLogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let timestamp = DateTime::parse_from_rfc3339(&row.created_at)
            .map_err(|e| StoreError::Corrupt(format!("bad log timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(EmailLogEntry {
            tenant_id: row.tenant_id,
            timestamp,
            direction: decode(&row.direction)?,
            from: row.from_addr,
            to: row.to_addr,
            subject: row.subject,
            status: decode(&row.status)?,
            reply_preview: row.reply_preview,
            message_id: row.message_id,
            delivery_id: row.delivery_id,
            usage_count: row.usage_count,
            usage_quota: row.usage_quota,
            ai_tokens_used: row.ai_tokens_used,
            cost_usd: row.cost_usd,
            error: row.error,
        })
    }
}

// ==================== Tenants ====================

#[async_trait]
impl TenantStore for SqliteStore {
    async fn get_tenant(&self, tenant_id: &str) -> StoreResult<Option<Tenant>> {
        self.fetch_tenant(tenant_id).await
    }

    async fn get_or_create_tenant(&self, new: &NewTenant) -> StoreResult<Tenant> {
        let tenant_id = super::tenant_key(&new.email);
        let now = now_secs();

        let inserted = sqlx::query(
            r#"
            INSERT INTO tenants (
                tenant_id, email, name, plan_tier, monthly_quota,
                subscription_status, role, created_at, updated_at
            ) VALUES (?, ?, ?, 'starter', ?, 'trial', ?, ?, ?)
            ON CONFLICT(tenant_id) DO NOTHING
            "#,
        )
        .bind(&tenant_id)
        .bind(&tenant_id)
        .bind(&new.name)
        .bind(new.monthly_quota)
        .bind(new.role.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            info!(tenant_id = %tenant_id, role = %new.role, "tenant_created");
        } else if new.role == Role::Admin {
            let promoted = sqlx::query(
                "UPDATE tenants SET role = 'admin', updated_at = ? WHERE tenant_id = ? AND role != 'admin'",
            )
            .bind(now)
            .bind(&tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if promoted > 0 {
                info!(tenant_id = %tenant_id, "tenant_promoted_to_admin");
            }
        }

        self.fetch_tenant(&tenant_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("tenant {} vanished after upsert", tenant_id)))
    }

    async fn update_tenant(
        &self,
        tenant_id: &str,
        update: &TenantUpdate,
    ) -> StoreResult<Option<Tenant>> {
        let affected = sqlx::query(
            r#"
            UPDATE tenants SET
                plan_tier = COALESCE(?, plan_tier),
                monthly_quota = COALESCE(?, monthly_quota),
                subscription_status = COALESCE(?, subscription_status),
                role = COALESCE(?, role),
                updated_at = ?
            WHERE tenant_id = ?
            "#,
        )
        .bind(update.plan_tier.map(|p| p.as_str()))
        .bind(update.monthly_quota)
        .bind(update.subscription_status.map(|s| s.as_str()))
        .bind(update.role.map(|r| r.as_str()))
        .bind(now_secs())
        .bind(tenant_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }

        self.fetch_tenant(tenant_id).await
    }

    async fn list_tenants(&self, limit: i64, offset: i64) -> StoreResult<Vec<Tenant>> {
        let rows = sqlx::query_as::<_, TenantRow>(
            "SELECT * FROM tenants ORDER BY created_at ASC, tenant_id ASC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Tenant::try_from).collect()
    }

    async fn tenant_stats(&self) -> StoreResult<TenantStats> {
        let (total, active): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN subscription_status = 'active' THEN 1 ELSE 0 END), 0)
            FROM tenants
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let plans: Vec<(String, i64)> =
            sqlx::query_as("SELECT plan_tier, COUNT(*) FROM tenants GROUP BY plan_tier")
                .fetch_all(&self.pool)
                .await?;

        Ok(TenantStats {
            total,
            active_subscriptions: active,
            plan_distribution: plans.into_iter().collect(),
        })
    }
}

// ==================== Settings ====================

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_settings(&self, tenant_id: &str) -> StoreResult<Option<TenantSettings>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            r#"
            SELECT tone, signature, max_length, auto_reply_enabled, notify_email, notify_slack
            FROM tenant_settings WHERE tenant_id = ?
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TenantSettings::from))
    }

    async fn save_settings(&self, tenant_id: &str, settings: &TenantSettings) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenant_settings (
                tenant_id, tone, signature, max_length, auto_reply_enabled,
                notify_email, notify_slack, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id) DO UPDATE SET
                tone = excluded.tone,
                signature = excluded.signature,
                max_length = excluded.max_length,
                auto_reply_enabled = excluded.auto_reply_enabled,
                notify_email = excluded.notify_email,
                notify_slack = excluded.notify_slack,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(&settings.tone)
        .bind(&settings.signature)
        .bind(settings.max_length)
        .bind(settings.auto_reply_enabled)
        .bind(settings.notifications.email)
        .bind(settings.notifications.slack)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ==================== Usage ====================

#[async_trait]
impl UsageStore for SqliteStore {
    async fn touch(&self, tenant_id: &str, month: &str) -> StoreResult<i64> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (tenant_id, month, count, updated_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(tenant_id, month) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(month)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM usage_counters WHERE tenant_id = ? AND month = ?",
        )
        .bind(tenant_id)
        .bind(month)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn try_increment(
        &self,
        tenant_id: &str,
        month: &str,
        amount: i64,
        limit: i64,
    ) -> StoreResult<Option<i64>> {
        // Check and write happen in one statement so concurrent callers
        // cannot both pass the limit.
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE usage_counters
            SET count = count + ?, updated_at = ?
            WHERE tenant_id = ? AND month = ? AND ? > 0 AND count + ? <= ?
            RETURNING count
            "#,
        )
        .bind(amount)
        .bind(now_secs())
        .bind(tenant_id)
        .bind(month)
        .bind(amount)
        .bind(amount)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count)
    }

    async fn get_usage(&self, tenant_id: &str, month: &str) -> StoreResult<Option<i64>> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM usage_counters WHERE tenant_id = ? AND month = ?",
        )
        .bind(tenant_id)
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count)
    }

    async fn reset_usage(&self, tenant_id: &str, month: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (tenant_id, month, count, updated_at)
            VALUES (?, ?, 0, ?)
            ON CONFLICT(tenant_id, month) DO UPDATE SET
                count = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(tenant_id)
        .bind(month)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;

        info!(tenant_id = %tenant_id, month = %month, "usage_counter_reset");

        Ok(())
    }

    async fn month_total(&self, month: &str) -> StoreResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(SUM(count), 0) FROM usage_counters WHERE month = ?",
        )
        .bind(month)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }
}

// ==================== Audit log ====================

#[async_trait]
impl AuditLog for SqliteStore {
    async fn record(&self, entry: &EmailLogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO email_logs (
                tenant_id, created_at, direction, from_addr, to_addr, subject,
                status, reply_preview, message_id, delivery_id, usage_count,
                usage_quota, ai_tokens_used, cost_usd, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(format_timestamp(entry.timestamp))
        .bind(entry.direction.as_str())
        .bind(&entry.from)
        .bind(&entry.to)
        .bind(&entry.subject)
        .bind(entry.status.as_str())
        .bind(&entry.reply_preview)
        .bind(&entry.message_id)
        .bind(&entry.delivery_id)
        .bind(entry.usage_count)
        .bind(entry.usage_quota)
        .bind(entry.ai_tokens_used)
        .bind(entry.cost_usd)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<EmailLogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT tenant_id, created_at, direction, from_addr, to_addr, subject,
                   status, reply_preview, message_id, delivery_id, usage_count,
                   usage_quota, ai_tokens_used, cost_usd, error
            FROM email_logs
            WHERE tenant_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EmailLogEntry::try_from).collect()
    }

    async fn count_for_tenant(&self, tenant_id: &str) -> StoreResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM email_logs WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn count_all(&self) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM email_logs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn stats_since(&self, tenant_id: &str, since: &str) -> StoreResult<LogStats> {
        let (received, sent, generated, failed): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN direction = 'inbound' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN direction = 'outbound' AND status = 'sent' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN direction = 'inbound' AND status = 'generated' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
            FROM email_logs
            WHERE tenant_id = ? AND created_at >= ?
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(LogStats {
            received,
            sent,
            generated,
            failed,
        })
    }
}

// ==================== Delivery claims ====================

#[async_trait]
impl DeliveryLedger for SqliteStore {
    async fn claim(&self, tenant_id: &str, message_id: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            r#"
            INSERT INTO delivery_claims (tenant_id, message_id, claimed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(tenant_id, message_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(message_id)
        .bind(now_secs())
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected == 1)
    }

    async fn release(&self, tenant_id: &str, message_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM delivery_claims WHERE tenant_id = ? AND message_id = ?")
            .bind(tenant_id)
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
