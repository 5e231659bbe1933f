//! Authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use retouch_shared::UserId;

use super::jwt::SupabaseJwtVerifier;
use crate::error::ApiError;

/// State the auth middleware needs
#[derive(Clone)]
pub struct AuthState {
    pub verifier: Arc<SupabaseJwtVerifier>,
}

/// The authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: UserId,
    pub email: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Reject requests without a valid Supabase access token
pub async fn require_auth(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers()).ok_or(ApiError::Unauthorized)?;

    let claims = auth.verifier.validate(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected access token");
        ApiError::InvalidToken
    })?;

    let user_id = claims.sub.parse::<UserId>().map_err(|_| {
        tracing::warn!(sub = %claims.sub, "Access token subject is not a user id");
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id,
        email: claims.email,
    });

    Ok(next.run(request).await)
}
