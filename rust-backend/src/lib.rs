//! ReplyMint - multi-tenant email auto-reply backend.
//!
//! Shared modules for the two binaries:
//! - `replymint-web`: webhooks, tenant API and admin API
//! - `replymint-sender`: drains the outbound reply queue through Mailgun
//!
//! ## Flow
//!
//! ```text
//! Webhook → signature check → EmailPipeline
//!         → QuotaGate → ReplyGenerator → AuditLog
//!         → OutboundDispatcher ─┬─ inline task ─────────────┐
//!                               └─ outbound_replies → Sender ┴→ Mailgun → AuditLog
//! ```

pub mod auth;
pub mod config;
pub mod inbound;
pub mod outbound;
pub mod pipeline;
pub mod queue;
pub mod quota;
pub mod reply;
pub mod store;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use inbound::InboundEmail;
pub use pipeline::{EmailPipeline, ReplyOutcome, ReplyStatus};
pub use queue::{OutboundJob, Publisher, OUTBOUND_QUEUE};
pub use quota::{QuotaGate, Reservation};
pub use store::SqliteStore;
pub use web::AppState;
