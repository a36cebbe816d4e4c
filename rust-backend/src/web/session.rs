//! Bearer token authentication for the tenant and admin routes.

use axum::http::{header, HeaderMap};
use tracing::warn;

use crate::auth::{bearer_token, AuthError};
use crate::store::{Role, Tenant, TenantStore};
use crate::web::{ApiError, AppState};

/// Resolve the calling tenant from `Authorization: Bearer <token>`.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let token = bearer_token(authorization)?;
    let claims = state.tokens.verify(token).map_err(|e| {
        warn!(error = %e, "bearer_token_rejected");
        e
    })?;

    match state.store.get_tenant(&claims.sub).await? {
        Some(tenant) => Ok(tenant),
        None => {
            warn!(tenant_id = %claims.sub, "bearer_token_unknown_tenant");
            Err(AuthError::UnknownUser.into())
        }
    }
}

/// As [`authenticate`], additionally requiring the admin role.
///
/// The role is read from the stored tenant, not the token, so a demotion
/// takes effect before the token expires.
pub async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Tenant, ApiError> {
    let tenant = authenticate(state, headers).await?;
    if tenant.role != Role::Admin {
        warn!(tenant_id = %tenant.tenant_id, "admin_access_denied");
        return Err(AuthError::Forbidden.into());
    }
    Ok(tenant)
}
