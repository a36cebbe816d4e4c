//! Webhook signature verification.
//!
//! - Mailgun: HMAC-SHA256(signing key, timestamp + token), hex.
//!   https://documentation.mailgun.com/docs/mailgun/user-manual/events/webhooks/#securing-webhooks
//! - Stripe: `Stripe-Signature: t=<ts>,v1=<hex>` where the digest is
//!   HMAC-SHA256(endpoint secret, "<ts>.<raw body>").
//! - Cloudflare: shared token in `X-Custom-Auth`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("{0} verification secret is not configured")]
    MissingSecret(&'static str),

    #[error("signature fields missing")]
    MissingFields,

    #[error("malformed signature header")]
    MalformedHeader,

    #[error("invalid signature timestamp")]
    InvalidTimestamp,

    #[error("signature timestamp is {age_seconds}s old")]
    Stale { age_seconds: u64 },

    #[error("signature mismatch")]
    Mismatch,
}

/// Decide whether a webhook must be verified.
///
/// Returns the secret to verify with, `None` when verification is skipped
/// (relaxed mode with no secret), or an error in strict mode with no secret.
pub fn required_secret<'a>(
    provider: &'static str,
    secret: Option<&'a str>,
    strict: bool,
) -> Result<Option<&'a str>, SignatureError> {
    match secret.map(str::trim).filter(|s| !s.is_empty()) {
        Some(secret) => Ok(Some(secret)),
        None if strict => {
            warn!(provider = provider, "webhook_secret_missing_rejected");
            Err(SignatureError::MissingSecret(provider))
        }
        None => {
            warn!(provider = provider, "webhook_secret_missing_unverified");
            Ok(None)
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn check_age(timestamp: u64, max_age_seconds: u64, provider: &'static str) -> Result<(), SignatureError> {
    let current_time = now_secs();
    let age = current_time.abs_diff(timestamp);

    if age > max_age_seconds {
        warn!(
            provider = provider,
            webhook_time = timestamp,
            current_time = current_time,
            age_seconds = age,
            max_age_seconds = max_age_seconds,
            "webhook_signature_stale"
        );
        return Err(SignatureError::Stale { age_seconds: age });
    }

    Ok(())
}

fn hmac_hex(key: &str, message: &[u8]) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| SignatureError::MissingSecret("hmac"))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a Mailgun webhook signature.
pub fn verify_mailgun_signature(
    signing_key: &str,
    timestamp: &str,
    token: &str,
    signature: &str,
    max_age_seconds: u64,
) -> Result<(), SignatureError> {
    if timestamp.is_empty() || token.is_empty() || signature.is_empty() {
        warn!(
            has_timestamp = !timestamp.is_empty(),
            has_token = !token.is_empty(),
            has_signature = !signature.is_empty(),
            "mailgun_signature_missing_fields"
        );
        return Err(SignatureError::MissingFields);
    }

    let webhook_time: u64 = timestamp.parse().map_err(|_| {
        warn!(timestamp = %timestamp, "mailgun_signature_invalid_timestamp");
        SignatureError::InvalidTimestamp
    })?;

    check_age(webhook_time, max_age_seconds, "mailgun")?;

    let expected = hmac_hex(signing_key, format!("{}{}", timestamp, token).as_bytes())?;

    if !constant_time_compare(&expected, signature) {
        warn!(
            expected_length = expected.len(),
            actual_length = signature.len(),
            "mailgun_signature_mismatch"
        );
        return Err(SignatureError::Mismatch);
    }

    Ok(())
}

/// Verify a `Stripe-Signature` header against the raw request body.
/// Any of several `v1` entries may match.
pub fn verify_stripe_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    tolerance_seconds: u64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value),
            Some(("v1", value)) => candidates.push(value),
            Some(_) => {}
            None => return Err(SignatureError::MalformedHeader),
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    let webhook_time: u64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidTimestamp)?;

    check_age(webhook_time, tolerance_seconds, "stripe")?;

    let mut signed = Vec::with_capacity(timestamp.len() + 1 + payload.len());
    signed.extend_from_slice(timestamp.as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);

    let expected = hmac_hex(secret, &signed)?;

    if candidates
        .iter()
        .any(|candidate| constant_time_compare(&expected, candidate))
    {
        Ok(())
    } else {
        warn!(candidates = candidates.len(), "stripe_signature_mismatch");
        Err(SignatureError::Mismatch)
    }
}

/// Verify the Cloudflare shared token.
pub fn verify_shared_token(expected: &str, provided: Option<&str>) -> Result<(), SignatureError> {
    let provided = provided.ok_or(SignatureError::MissingFields)?;
    if constant_time_compare(expected, provided) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn mailgun_signature(key: &str, timestamp: &str, token: &str) -> String {
        hmac_hex(key, format!("{}{}", timestamp, token).as_bytes()).unwrap()
    }

    pub(crate) fn stripe_header(secret: &str, timestamp: u64, payload: &[u8]) -> String {
        let mut signed = format!("{}.", timestamp).into_bytes();
        signed.extend_from_slice(payload);
        format!("t={},v1={}", timestamp, hmac_hex(secret, &signed).unwrap())
    }

    #[test]
    fn test_required_secret_policy() {
        assert_eq!(required_secret("mailgun", Some("k"), true), Ok(Some("k")));
        assert_eq!(required_secret("mailgun", Some("k"), false), Ok(Some("k")));
        assert_eq!(
            required_secret("mailgun", None, true),
            Err(SignatureError::MissingSecret("mailgun"))
        );
        assert_eq!(required_secret("mailgun", Some("  "), false), Ok(None));
    }

    #[test]
    fn test_mailgun_missing_fields() {
        assert_eq!(
            verify_mailgun_signature("key", "", "token", "sig", 300),
            Err(SignatureError::MissingFields)
        );
        assert_eq!(
            verify_mailgun_signature("key", "123", "", "sig", 300),
            Err(SignatureError::MissingFields)
        );
        assert_eq!(
            verify_mailgun_signature("key", "123", "token", "", 300),
            Err(SignatureError::MissingFields)
        );
    }

    #[test]
    fn test_mailgun_invalid_timestamp() {
        assert_eq!(
            verify_mailgun_signature("key", "not-a-number", "token", "sig", 300),
            Err(SignatureError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_mailgun_stale() {
        // Year 2000
        let sig = mailgun_signature("key", "946684800", "token");
        assert!(matches!(
            verify_mailgun_signature("key", "946684800", "token", &sig, 300),
            Err(SignatureError::Stale { .. })
        ));
    }

    #[test]
    fn test_mailgun_valid_and_forged() {
        let timestamp = now_secs().to_string();
        let signature = mailgun_signature("test-signing-key", &timestamp, "random-token");

        assert_eq!(
            verify_mailgun_signature("test-signing-key", &timestamp, "random-token", &signature, 300),
            Ok(())
        );
        assert_eq!(
            verify_mailgun_signature("other-key", &timestamp, "random-token", &signature, 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stripe_valid() {
        let payload = br#"{"type":"invoice.paid"}"#;
        let header = stripe_header("whsec_test", now_secs(), payload);

        assert_eq!(verify_stripe_signature("whsec_test", &header, payload, 300), Ok(()));
    }

    #[test]
    fn test_stripe_accepts_any_v1_candidate() {
        let payload = b"{}";
        let ts = now_secs();
        let good = stripe_header("whsec_test", ts, payload);
        let header = format!("t={},v1=deadbeef,{}", ts, good.split_once(',').unwrap().1);

        assert_eq!(verify_stripe_signature("whsec_test", &header, payload, 300), Ok(()));
    }

    #[test]
    fn test_stripe_rejects_tampered_body() {
        let header = stripe_header("whsec_test", now_secs(), b"{\"a\":1}");

        assert_eq!(
            verify_stripe_signature("whsec_test", &header, b"{\"a\":2}", 300),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stripe_rejects_stale() {
        let header = stripe_header("whsec_test", now_secs() - 301, b"{}");

        assert!(matches!(
            verify_stripe_signature("whsec_test", &header, b"{}", 300),
            Err(SignatureError::Stale { .. })
        ));
    }

    #[test]
    fn test_stripe_malformed_header() {
        assert_eq!(
            verify_stripe_signature("whsec_test", "garbage", b"{}", 300),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verify_stripe_signature("whsec_test", "t=123", b"{}", 300),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verify_stripe_signature("whsec_test", "v1=abc", b"{}", 300),
            Err(SignatureError::MalformedHeader)
        );
    }

    #[test]
    fn test_shared_token() {
        assert_eq!(verify_shared_token("abc", Some("abc")), Ok(()));
        assert_eq!(verify_shared_token("abc", Some("abd")), Err(SignatureError::Mismatch));
        assert_eq!(verify_shared_token("abc", None), Err(SignatureError::MissingFields));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
