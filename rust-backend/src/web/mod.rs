//! HTTP surface: provider webhooks, tenant API and admin API.
//!
//! Webhook handlers verify the caller and run the message through the
//! [`EmailPipeline`] before answering, so the response carries the outcome.
//! Sending the reply happens afterwards through the outbound dispatcher.

pub mod admin;
pub mod api;
pub mod billing;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod session;
pub mod signature;
pub mod users;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::auth::TokenService;
use crate::pipeline::EmailPipeline;
use crate::store::models::format_timestamp;
use crate::store::SqliteStore;
use crate::Config;

pub use error::ApiError;
pub use routes::router;
pub use signature::{verify_mailgun_signature, verify_stripe_signature, SignatureError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub pipeline: Arc<EmailPipeline>,
    pub tokens: Arc<TokenService>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<SqliteStore>, pipeline: EmailPipeline) -> Self {
        let tokens = TokenService::from_config(&config);
        Self {
            config: Arc::new(config),
            store,
            pipeline: Arc::new(pipeline),
            tokens: Arc::new(tokens),
        }
    }
}

/// `{status: "success", data, timestamp}` envelope used by the JSON API.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub data: T,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            status: "success",
            data,
            timestamp: format_timestamp(Utc::now()),
        }
    }
}
