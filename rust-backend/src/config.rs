//! Configuration module for environment variable parsing.
//!
//! Everything is read once at process start into a [`Config`] that is then
//! shared by reference with every component. Business logic never reads the
//! environment directly.

use std::env;
use std::str::FromStr;
use tracing::warn;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment name, reported by `/info` and `/ready`
    pub environment: String,

    /// Port for the web server to listen on
    pub port: u16,

    // =========================================================================
    // Storage
    // =========================================================================
    /// SQLite connection URL for tenants, usage counters and audit logs
    pub database_url: String,

    /// Maximum number of pooled database connections
    pub database_max_connections: u32,

    // =========================================================================
    // Outbound queue
    // =========================================================================
    /// RabbitMQ connection URL (CloudAMQP). When unset, outbound replies are
    /// sent from a task spawned inside the web process.
    pub cloudamqp_url: Option<String>,

    /// Maximum number of outbound jobs the sender worker processes at once
    pub worker_concurrency: usize,

    // =========================================================================
    // Webhook verification
    // =========================================================================
    /// Reject webhooks whose verification secret is not configured.
    /// When false, a missing secret admits the request with a warning.
    pub strict_signature_check: bool,

    /// Mailgun signing key for HMAC signature verification
    pub mailgun_signing_key: Option<String>,

    /// Mailgun domain for recipient validation
    pub mailgun_domain: Option<String>,

    /// Maximum age in seconds for Mailgun webhook timestamps
    pub mailgun_signature_max_age: u64,

    /// Cloudflare authentication token for webhook verification
    pub cloudflare_auth_token: Option<String>,

    /// Stripe webhook endpoint secret (`whsec_...`)
    pub stripe_webhook_secret: Option<String>,

    /// Maximum age in seconds for Stripe signature timestamps
    pub stripe_signature_tolerance: u64,

    // =========================================================================
    // Outbound email
    // =========================================================================
    /// Mailgun private API key for sending
    pub mailgun_api_key: Option<String>,

    /// Mailgun sending domain
    pub mailgun_domain_outbound: Option<String>,

    /// Mailgun API base URL
    pub mailgun_api_base: String,

    /// Outbound send timeout in milliseconds
    pub outbound_timeout_ms: u64,

    // =========================================================================
    // Reply generation
    // =========================================================================
    /// OpenAI API key; generation is unavailable without it
    pub openai_api_key: Option<String>,

    /// Chat completions API base URL
    pub openai_api_base: String,

    /// Model name
    pub openai_model: String,

    /// Upper bound on generated tokens
    pub ai_max_tokens: u32,

    /// Sampling temperature
    pub ai_temperature: f32,

    /// Generation timeout in milliseconds
    pub ai_timeout_ms: u64,

    /// Estimated cost in USD per 1000 tokens, recorded in the audit log
    pub ai_cost_per_1k_tokens: f64,

    // =========================================================================
    // Tenants and auth
    // =========================================================================
    /// HS256 secret for bearer tokens
    pub jwt_secret: Option<String>,

    /// Bearer token lifetime in minutes
    pub jwt_expiry_minutes: i64,

    /// Quota applied to tenants without an explicit one
    pub default_monthly_quota: i64,

    /// Maximum number of characters kept in reply previews
    pub preview_max_chars: usize,

    /// Origins allowed by CORS; empty disables cross-origin access
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "staging".to_string()),

            port: parse_or("PORT", 8080),

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://replymint.db".to_string()),

            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 5),

            cloudamqp_url: non_empty("CLOUDAMQP_URL"),

            worker_concurrency: parse_or("WORKER_CONCURRENCY", 20),

            strict_signature_check: parse_bool("STRICT_SIGNATURE_CHECK", true),

            mailgun_signing_key: non_empty("MAILGUN_SIGNING_KEY"),

            mailgun_domain: non_empty("MAILGUN_DOMAIN"),

            mailgun_signature_max_age: parse_or("MAILGUN_SIGNATURE_MAX_AGE", 300),

            cloudflare_auth_token: non_empty("CLOUDFLARE_AUTH_TOKEN"),

            stripe_webhook_secret: non_empty("STRIPE_WEBHOOK_SECRET"),

            stripe_signature_tolerance: parse_or("STRIPE_SIGNATURE_TOLERANCE", 300),

            mailgun_api_key: non_empty("MAILGUN_API_KEY"),

            mailgun_domain_outbound: non_empty("MAILGUN_DOMAIN_OUTBOUND"),

            mailgun_api_base: env::var("MAILGUN_API_BASE")
                .unwrap_or_else(|_| "https://api.mailgun.net".to_string()),

            outbound_timeout_ms: parse_or("OUTBOUND_TIMEOUT_MS", 10_000),

            openai_api_key: non_empty("OPENAI_API_KEY"),

            openai_api_base: env::var("OPENAI_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),

            openai_model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),

            ai_max_tokens: parse_or("AI_MAX_TOKENS", 400),

            ai_temperature: parse_or("AI_TEMPERATURE", 0.6),

            ai_timeout_ms: parse_or("AI_TIMEOUT_MS", 20_000),

            ai_cost_per_1k_tokens: parse_or("AI_COST_PER_1K_TOKENS", 0.0006),

            jwt_secret: non_empty("JWT_SECRET"),

            jwt_expiry_minutes: parse_or("JWT_EXPIRY_MINUTES", 60),

            default_monthly_quota: parse_or("DEFAULT_MONTHLY_QUOTA", 200),

            preview_max_chars: parse_or("PREVIEW_MAX_CHARS", 256),

            allowed_origins: parse_csv("ALLOWED_ORIGINS").unwrap_or_default(),
        }
    }
}

impl Default for Config {
    /// Defaults with every secret unset, used by tests and local tooling.
    fn default() -> Self {
        Config {
            environment: "test".to_string(),
            port: 8080,
            database_url: "sqlite::memory:".to_string(),
            database_max_connections: 1,
            cloudamqp_url: None,
            worker_concurrency: 20,
            strict_signature_check: true,
            mailgun_signing_key: None,
            mailgun_domain: None,
            mailgun_signature_max_age: 300,
            cloudflare_auth_token: None,
            stripe_webhook_secret: None,
            stripe_signature_tolerance: 300,
            mailgun_api_key: None,
            mailgun_domain_outbound: None,
            mailgun_api_base: "https://api.mailgun.net".to_string(),
            outbound_timeout_ms: 10_000,
            openai_api_key: None,
            openai_api_base: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            ai_max_tokens: 400,
            ai_temperature: 0.6,
            ai_timeout_ms: 20_000,
            ai_cost_per_1k_tokens: 0.0006,
            jwt_secret: None,
            jwt_expiry_minutes: 60,
            default_monthly_quota: 200,
            preview_max_chars: 256,
            allowed_origins: Vec::new(),
        }
    }
}

/// Parse a variable into `T`, falling back to `default` when unset or invalid.
fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(env_var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a boolean flag. Accepts true/false, 1/0, yes/no, on/off.
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}

/// Read a variable, treating blank values as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a comma-separated list of strings.
fn parse_csv(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_valid() {
        env::set_var("TEST_REPLYMINT_PORT", "9090");
        let result: u16 = parse_or("TEST_REPLYMINT_PORT", 1);
        assert_eq!(result, 9090);
        env::remove_var("TEST_REPLYMINT_PORT");
    }

    #[test]
    fn test_parse_or_invalid_uses_default() {
        env::set_var("TEST_REPLYMINT_BAD_INT", "not-a-number");
        let result: i64 = parse_or("TEST_REPLYMINT_BAD_INT", 200);
        assert_eq!(result, 200);
        env::remove_var("TEST_REPLYMINT_BAD_INT");
    }

    #[test]
    fn test_parse_bool_variants() {
        env::set_var("TEST_REPLYMINT_FLAG_OFF", "off");
        env::set_var("TEST_REPLYMINT_FLAG_ON", "YES");
        env::set_var("TEST_REPLYMINT_FLAG_JUNK", "maybe");
        assert!(!parse_bool("TEST_REPLYMINT_FLAG_OFF", true));
        assert!(parse_bool("TEST_REPLYMINT_FLAG_ON", false));
        assert!(parse_bool("TEST_REPLYMINT_FLAG_JUNK", true));
        assert!(!parse_bool("TEST_REPLYMINT_FLAG_MISSING", false));
        env::remove_var("TEST_REPLYMINT_FLAG_OFF");
        env::remove_var("TEST_REPLYMINT_FLAG_ON");
        env::remove_var("TEST_REPLYMINT_FLAG_JUNK");
    }

    #[test]
    fn test_non_empty_treats_blank_as_unset() {
        env::set_var("TEST_REPLYMINT_BLANK", "   ");
        assert_eq!(non_empty("TEST_REPLYMINT_BLANK"), None);
        env::remove_var("TEST_REPLYMINT_BLANK");
    }

    #[test]
    fn test_parse_csv() {
        env::set_var("TEST_REPLYMINT_CSV", "https://a.example, ,https://b.example");
        let result = parse_csv("TEST_REPLYMINT_CSV");
        assert_eq!(
            result,
            Some(vec![
                "https://a.example".to_string(),
                "https://b.example".to_string()
            ])
        );
        env::remove_var("TEST_REPLYMINT_CSV");
    }

    #[test]
    fn test_default_is_strict_with_documented_limits() {
        let config = Config::default();
        assert!(config.strict_signature_check);
        assert_eq!(config.default_monthly_quota, 200);
        assert_eq!(config.preview_max_chars, 256);
        assert!(config.outbound_timeout_ms <= 10_000);
    }
}
