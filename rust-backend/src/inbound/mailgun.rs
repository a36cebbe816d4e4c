//! Mailgun inbound route payloads.
//!
//! Mailgun posts the message already parsed as form fields, so only the
//! Message-Id needs digging out of the headers.

use serde::Deserialize;
use tracing::warn;

use super::email_parser::clean_message_id;
use super::InboundEmail;

/// Mailgun inbound form. Field names use hyphens, which are renamed here.
#[derive(Debug, Default, Deserialize)]
pub struct MailgunInboundForm {
    #[serde(default)]
    pub recipient: String,
    #[serde(default, rename = "To")]
    pub to_header: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, rename = "from")]
    pub from_field: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, rename = "body-plain")]
    pub body_plain: Option<String>,
    #[serde(default, rename = "stripped-text")]
    pub stripped_text: Option<String>,
    #[serde(default, rename = "message-headers")]
    pub message_headers: Option<String>,
    #[serde(default, rename = "Message-Id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

impl MailgunInboundForm {
    /// Envelope recipient, falling back to the `To` header.
    pub fn recipient(&self) -> &str {
        if self.recipient.trim().is_empty() {
            &self.to_header
        } else {
            &self.recipient
        }
    }

    pub fn into_email(self) -> InboundEmail {
        let message_id = self
            .message_id
            .as_deref()
            .and_then(clean_message_id)
            .or_else(|| extract_message_id_from_headers(self.message_headers.as_deref()));

        let to = self.recipient().to_string();

        let from = if self.from_field.trim().is_empty() {
            self.sender
        } else {
            self.from_field
        };

        let body = self
            .body_plain
            .filter(|s| !s.trim().is_empty())
            .or(self.stripped_text)
            .unwrap_or_default();

        InboundEmail {
            from,
            to,
            subject: self.subject,
            body,
            message_id,
        }
    }
}

/// Mailgun delivery event form. Only the fields worth logging.
#[derive(Debug, Default, Deserialize)]
pub struct MailgunEventForm {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default, rename = "Message-Id")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub signature: String,
}

/// Extract Message-Id from Mailgun's `message-headers` JSON, an array of
/// `[name, value]` pairs.
pub fn extract_message_id_from_headers(message_headers: Option<&str>) -> Option<String> {
    let headers = message_headers?;
    if headers.trim().is_empty() {
        return None;
    }

    let pairs: Vec<Vec<String>> = match serde_json::from_str(headers) {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(
                error = %e,
                headers_length = headers.len(),
                "mailgun_headers_parse_failed"
            );
            return None;
        }
    };

    pairs
        .iter()
        .filter(|pair| pair.len() >= 2 && pair[0].eq_ignore_ascii_case("message-id"))
        .find_map(|pair| clean_message_id(&pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_message_id_from_headers() {
        let headers = r#"[["Subject", "Hi"], ["Message-Id", "<abc123@example.com>"]]"#;
        assert_eq!(
            extract_message_id_from_headers(Some(headers)),
            Some("abc123@example.com".to_string())
        );
        assert_eq!(extract_message_id_from_headers(Some("not json")), None);
        assert_eq!(extract_message_id_from_headers(Some("[]")), None);
        assert_eq!(extract_message_id_from_headers(None), None);
    }

    #[test]
    fn test_into_email_prefers_explicit_fields() {
        let form = MailgunInboundForm {
            recipient: "support@tenant.example".to_string(),
            sender: "bounce@customer.example".to_string(),
            from_field: "Customer <c@customer.example>".to_string(),
            subject: "Help".to_string(),
            body_plain: Some("".to_string()),
            stripped_text: Some("Need help".to_string()),
            message_headers: Some(r#"[["Message-Id", "<h@x>"]]"#.to_string()),
            message_id: Some("<direct@x>".to_string()),
            ..Default::default()
        };

        let email = form.into_email();

        assert_eq!(email.from, "Customer <c@customer.example>");
        assert_eq!(email.to, "support@tenant.example");
        assert_eq!(email.body, "Need help");
        assert_eq!(email.message_id, Some("direct@x".to_string()));
    }

    #[test]
    fn test_into_email_falls_back_to_to_header_and_sender() {
        let form = MailgunInboundForm {
            to_header: "support@tenant.example".to_string(),
            sender: "c@customer.example".to_string(),
            message_headers: Some(r#"[["Message-Id", "<h@x>"]]"#.to_string()),
            ..Default::default()
        };

        let email = form.into_email();

        assert_eq!(email.to, "support@tenant.example");
        assert_eq!(email.from, "c@customer.example");
        assert_eq!(email.message_id, Some("h@x".to_string()));
        assert_eq!(email.body, "");
    }
}
