//! RFC 5322 email parser using mailparse.
//!
//! Used for Cloudflare Email Worker payloads, which forward the raw message.

use anyhow::{Context, Result};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use tracing::{info, warn};

/// Fields extracted from a raw message.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedEmail {
    /// Message-Id header value (without angle brackets)
    pub message_id: Option<String>,
    pub subject: Option<String>,
    /// Plain text body, or the HTML body when no text part exists
    pub body: Option<String>,
}

/// Parse raw RFC 5322 content (headers + body).
pub fn parse_raw_email(raw_content: &str) -> Result<ParsedEmail> {
    let mail = parse_mail(raw_content.as_bytes()).context("Failed to parse email")?;

    let message_id = mail
        .headers
        .get_first_value("Message-Id")
        .and_then(|id| clean_message_id(&id));

    let subject = mail.headers.get_first_value("Subject");

    let body = find_part(&mail, "text/plain").or_else(|| find_part(&mail, "text/html"));

    info!(
        raw_content_length = raw_content.len(),
        message_id = ?message_id,
        has_body = body.is_some(),
        body_length = body.as_ref().map(|b| b.len()).unwrap_or(0),
        "email_parse_complete"
    );

    Ok(ParsedEmail {
        message_id,
        subject,
        body,
    })
}

/// Strip whitespace and angle brackets; `None` when nothing is left.
pub fn clean_message_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_matches(|c| c == '<' || c == '>').trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Depth-first search for the first non-empty part of `mimetype`.
fn find_part(mail: &ParsedMail, mimetype: &str) -> Option<String> {
    let content_type = mail.ctype.mimetype.as_str();

    if content_type.starts_with("multipart/") {
        return mail
            .subparts
            .iter()
            .find_map(|part| find_part(part, mimetype));
    }

    if content_type == mimetype {
        return extract_body_text(mail);
    }

    None
}

fn extract_body_text(mail: &ParsedMail) -> Option<String> {
    match mail.get_body() {
        Ok(body) if !body.trim().is_empty() => Some(body.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "email_body_extraction_failed");
            None
        }
    }
}
