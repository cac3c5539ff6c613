use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::{
    authenticator::AuthError, license_admin::LicenseAdminError,
    license_validator::ValidationError, verification_code::ChallengeError,
};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<LicenseAdminError> for AppError {
    fn from(e: LicenseAdminError) -> Self {
        match e {
            LicenseAdminError::Validation(msg) => AppError::Validation(msg),
            LicenseAdminError::NotFound(what) => {
                AppError::NotFound(format!("{} not found", what))
            }
            LicenseAdminError::DuplicateKey => {
                AppError::Conflict("License key already exists".to_string())
            }
            e @ LicenseAdminError::HasActiveActivations { .. } => {
                AppError::Conflict(e.to_string())
            }
            LicenseAdminError::Store(e) => AppError::Store(e),
            LicenseAdminError::KeyGeneration(e) => AppError::Internal(e.into()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => {
                AppError::Unauthorized("Invalid credentials".to_string())
            }
            AuthError::VerificationUnavailable(_) => AppError::Unavailable(
                "Could not send verification email. Please try again later.".to_string(),
            ),
            e @ (AuthError::InvalidOrExpired | AuthError::Expired | AuthError::WrongCode) => {
                AppError::Unauthorized(e.to_string())
            }
            e @ (AuthError::SamePassword | AuthError::WeakPassword) => {
                AppError::Validation(e.to_string())
            }
            AuthError::Store(e) => AppError::Store(e),
            AuthError::Challenge(ChallengeError::Store(e)) => AppError::Store(e),
            e @ (AuthError::Challenge(_) | AuthError::Password(_) | AuthError::Session(_)) => {
                AppError::Internal(e.into())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_debug = format!("{:?}", self);

        let (status, error_message) = match self {
            AppError::Store(e) if e.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable".to_string(),
            ),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %error_debug, "Request failed");
        }

        let body = Json(json!({
            "error": error_message,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_share_status() {
        for e in [
            AuthError::InvalidCredentials,
            AuthError::InvalidOrExpired,
            AuthError::Expired,
            AuthError::WrongCode,
        ] {
            let response = AppError::from(e).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_dispatch_failure_is_service_unavailable() {
        let response =
            AppError::from(AuthError::VerificationUnavailable("relay down".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_transient_store_failure_is_service_unavailable() {
        let response =
            AppError::from(StoreError::Database(sqlx::Error::PoolTimedOut)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_active_devices_block_delete_with_conflict() {
        let error = LicenseAdminError::HasActiveActivations { active_devices: 2 };
        let response = AppError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
