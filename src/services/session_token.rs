use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::admin_user::AdminUser;

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

#[derive(thiserror::Error, Debug)]
pub enum SessionTokenError {
    #[error("Session expired")]
    Expired,

    #[error("Invalid session token: {0}")]
    Invalid(String),

    #[error("Failed to sign session token: {0}")]
    Signing(String),
}

/// Claims carried by an admin session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Admin user id.
    pub sub: Uuid,
    pub username: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and checks HS256 session tokens.
#[derive(Clone)]
pub struct SessionSigner {
    secret: Secret<String>,
    ttl: Duration,
}

impl SessionSigner {
    pub fn new(secret: Secret<String>, ttl: Duration) -> Self {
        Self { secret, ttl }
    }

    pub fn issue(&self, admin: &AdminUser) -> Result<String, SessionTokenError> {
        self.issue_at(admin, Utc::now())
    }

    pub fn issue_at(
        &self,
        admin: &AdminUser,
        now: DateTime<Utc>,
    ) -> Result<String, SessionTokenError> {
        let claims = SessionClaims {
            sub: admin.id,
            username: admin.username.clone(),
            role: admin.role.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };

        let key = EncodingKey::from_secret(self.secret.expose_secret().as_bytes());
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|e| SessionTokenError::Signing(e.to_string()))
    }

    pub fn decode(&self, token: &str) -> Result<SessionClaims, SessionTokenError> {
        let key = DecodingKey::from_secret(self.secret.expose_secret().as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "exp", "iat"]);

        jsonwebtoken::decode::<SessionClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => SessionTokenError::Expired,
                _ => SessionTokenError::Invalid(e.to_string()),
            })
    }
}
