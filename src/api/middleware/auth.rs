use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::error::AppError;
use crate::services::session_token::SessionTokenError;

/// Extension type that holds the authenticated admin
#[derive(Debug, Clone)]
pub struct AuthenticatedAdmin {
    pub admin_id: Uuid,
    pub username: String,
    pub role: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware that requires a valid admin session token
pub async fn require_admin(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;

    let claims = state
        .authenticator
        .sessions()
        .decode(token)
        .map_err(|e| match e {
            SessionTokenError::Expired => {
                AppError::Unauthorized("Session expired. Please log in again.".to_string())
            }
            other => {
                tracing::debug!(error = %other, "Rejected admin session token");
                AppError::Unauthorized("Invalid session token".to_string())
            }
        })?;

    request.extensions_mut().insert(AuthenticatedAdmin {
        admin_id: claims.sub,
        username: claims.username,
        role: claims.role,
    });

    Ok(next.run(request).await)
}
