//! Bearer token issuing and verification (HS256).

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{Role, Tenant};
use crate::Config;

pub const TOKEN_ISSUER: &str = "replymint";
pub const TOKEN_AUDIENCE: &str = "replymint-app";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant id
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    Expired,

    #[error("User not found")]
    UnknownUser,

    #[error("Admin access required")]
    Forbidden,

    #[error("Token signing is not configured")]
    NotConfigured,

    #[error("failed to sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies tenant bearer tokens.
pub struct TokenService {
    keys: Option<Keys>,
    validation: Validation,
    expiry_minutes: i64,
}

impl TokenService {
    pub fn new(secret: Option<&str>, expiry_minutes: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_audience(&[TOKEN_AUDIENCE]);

        Self {
            keys: secret.map(|s| Keys {
                encoding: EncodingKey::from_secret(s.as_bytes()),
                decoding: DecodingKey::from_secret(s.as_bytes()),
            }),
            validation,
            expiry_minutes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.jwt_secret.as_deref(), config.jwt_expiry_minutes)
    }

    pub fn is_configured(&self) -> bool {
        self.keys.is_some()
    }

    pub fn issue(&self, tenant: &Tenant) -> Result<String, AuthError> {
        let keys = self.keys.as_ref().ok_or(AuthError::NotConfigured)?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: tenant.tenant_id.clone(),
            email: tenant.email.clone(),
            role: tenant.role,
            iss: TOKEN_ISSUER.to_string(),
            aud: TOKEN_AUDIENCE.to_string(),
            iat: now,
            exp: now + self.expiry_minutes * 60,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding).map_err(AuthError::Signing)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let keys = self.keys.as_ref().ok_or(AuthError::NotConfigured)?;

        decode::<Claims>(token, &keys.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let (scheme, token) = value.trim().split_once(' ').ok_or(AuthError::MissingToken)?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token.trim())
}
