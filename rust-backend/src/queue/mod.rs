//! Queue module for RabbitMQ operations.
//!
//! ## Architecture
//!
//! ```text
//! Web Server → outbound_replies queue → Sender worker → Mailgun
//! ```

pub mod publisher;
pub mod types;

pub use publisher::{declare_outbound_queue, Publisher};
pub use types::{reply_subject, OutboundJob, OUTBOUND_QUEUE};
