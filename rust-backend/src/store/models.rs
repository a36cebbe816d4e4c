//! Records persisted by the store and the enums they carry.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Declares a snake_case text enum stored as TEXT and serialized as a string.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(format!("unknown {} value: {}", stringify!($name), other)),
                }
            }
        }
    };
}

text_enum! {
    /// Billing plan. Each tier carries a default monthly quota.
    pub enum PlanTier {
        Starter => "starter",
        Pro => "pro",
        Business => "business",
    }
}

impl PlanTier {
    /// Monthly quota granted when a tenant moves onto this plan.
    pub fn default_quota(&self) -> i64 {
        match self {
            PlanTier::Starter => 200,
            PlanTier::Pro => 1_000,
            PlanTier::Business => 5_000,
        }
    }
}

text_enum! {
    pub enum SubscriptionStatus {
        Trial => "trial",
        Active => "active",
        PastDue => "past_due",
        Canceled => "canceled",
        /// Set by an administrator; tenants are never deleted.
        Disabled => "disabled",
    }
}

text_enum! {
    pub enum Role {
        User => "user",
        Admin => "admin",
    }
}

text_enum! {
    pub enum Direction {
        Inbound => "inbound",
        Outbound => "outbound",
    }
}

text_enum! {
    /// Outcome recorded on an audit log entry.
    pub enum EmailStatus {
        Generated => "generated",
        QuotaExceeded => "quota_exceeded",
        AiUnavailable => "ai_unavailable",
        Sent => "sent",
        Failed => "failed",
    }
}

/// Derive the tenant key from an email address.
///
/// `"Jane <Jane@Example.com>"` and `" jane@example.com "` both map to
/// `"jane@example.com"`.
pub fn tenant_key(address: &str) -> String {
    let trimmed = address.trim();
    let bare = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    };
    bare.trim().to_lowercase()
}

/// Keep at most `max_chars` characters of `text`.
pub fn truncate_preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Format a timestamp so that lexical order equals chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A customer account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub email: String,
    pub name: String,
    pub plan_tier: PlanTier,
    pub monthly_quota: i64,
    pub subscription_status: SubscriptionStatus,
    pub role: Role,
    /// Unix seconds
    pub created_at: i64,
    /// Unix seconds
    pub updated_at: i64,
}

/// Input for get-or-create.
#[derive(Debug, Clone)]
pub struct NewTenant {
    pub email: String,
    pub name: String,
    pub role: Role,
    pub monthly_quota: i64,
}

/// Partial tenant update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TenantUpdate {
    pub plan_tier: Option<PlanTier>,
    pub monthly_quota: Option<i64>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub role: Option<Role>,
}

impl TenantUpdate {
    pub fn is_empty(&self) -> bool {
        self.plan_tier.is_none()
            && self.monthly_quota.is_none()
            && self.subscription_status.is_none()
            && self.role.is_none()
    }

    /// Names of the fields this update sets, in a stable order.
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.plan_tier.is_some() {
            names.push("plan_tier");
        }
        if self.monthly_quota.is_some() {
            names.push("monthly_quota");
        }
        if self.subscription_status.is_some() {
            names.push("subscription_status");
        }
        if self.role.is_some() {
            names.push("role");
        }
        names
    }
}

/// Aggregate figures for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TenantStats {
    pub total: i64,
    pub active_subscriptions: i64,
    pub plan_distribution: BTreeMap<String, i64>,
}

/// Notification toggles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notifications {
    pub email: bool,
    pub slack: bool,
}

impl Default for Notifications {
    fn default() -> Self {
        Self {
            email: true,
            slack: false,
        }
    }
}

/// Per-tenant reply settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub tone: String,
    pub signature: String,
    pub max_length: i64,
    pub auto_reply_enabled: bool,
    pub notifications: Notifications,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            tone: "professional".to_string(),
            signature: String::new(),
            max_length: 700,
            auto_reply_enabled: true,
            notifications: Notifications::default(),
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub status: EmailStatus,
    pub reply_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_tokens_used: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-tenant email counts over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogStats {
    pub received: i64,
    pub sent: i64,
    pub generated: i64,
    pub failed: i64,
}

impl LogStats {
    /// Share of received emails that got a generated reply.
    pub fn success_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.generated as f64 / self.received as f64
        }
    }
}
