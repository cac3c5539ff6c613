use std::time::Duration as StdDuration;

use secrecy::Secret;
use serde::Deserialize;

use crate::jobs::challenge_cleanup;
use crate::services::{
    mailer::MailerConfig, session_token::DEFAULT_SESSION_TTL_HOURS,
    verification_code::DEFAULT_CHALLENGE_TTL_MINUTES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub host: String,
    pub port: u16,

    // Admin sessions
    pub jwt_secret: Secret<String>,
    pub session_ttl_hours: i64,

    // Verification codes
    pub two_factor_enabled: bool,
    pub challenge_ttl_minutes: i64,
    pub two_fa_email: String,
    pub challenge_cleanup_cron: String,

    // HTTP mail relay
    pub mail_api_url: Option<String>,
    pub mail_api_token: Option<Secret<String>>,
    pub mail_from: String,
    pub mail_timeout_secs: u64,

    // First admin account
    pub bootstrap_admin_username: Option<String>,
    pub bootstrap_admin_password: Option<Secret<String>>,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let store_backend = match config.get_string("store_backend") {
            Ok(value) => match value.to_ascii_lowercase().as_str() {
                "postgres" => StoreBackend::Postgres,
                "memory" => StoreBackend::Memory,
                other => {
                    return Err(config::ConfigError::Message(format!(
                        "unknown STORE_BACKEND '{}', expected postgres or memory",
                        other
                    )))
                }
            },
            Err(_) => StoreBackend::Postgres,
        };

        let database_url: Option<String> = config.get("database_url").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(config::ConfigError::NotFound("database_url".to_string()));
        }

        let two_factor_enabled: bool = config.get("two_factor_enabled").unwrap_or(true);
        let two_fa_email = config
            .get::<String>("two_fa_email")
            .unwrap_or_default()
            .trim()
            .to_string();
        require_code_recipient(two_factor_enabled, &two_fa_email)?;

        Ok(Self {
            store_backend,
            database_url,
            database_max_connections: config.get("database_max_connections").unwrap_or(20),
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port").unwrap_or(5000),

            jwt_secret: Secret::new(config.get("jwt_secret")?),
            session_ttl_hours: config
                .get("session_ttl_hours")
                .unwrap_or(DEFAULT_SESSION_TTL_HOURS),

            two_factor_enabled,
            challenge_ttl_minutes: config
                .get("challenge_ttl_minutes")
                .unwrap_or(DEFAULT_CHALLENGE_TTL_MINUTES),
            two_fa_email,
            challenge_cleanup_cron: config
                .get("challenge_cleanup_cron")
                .unwrap_or_else(|_| challenge_cleanup::DEFAULT_CRON.to_string()),

            mail_api_url: config.get("mail_api_url").ok(),
            mail_api_token: config
                .get::<String>("mail_api_token")
                .ok()
                .map(Secret::new),
            mail_from: config
                .get("mail_from")
                .unwrap_or_else(|_| "no-reply@localhost".to_string()),
            mail_timeout_secs: config.get("mail_timeout_secs").unwrap_or(10),

            bootstrap_admin_username: config.get("bootstrap_admin_username").ok(),
            bootstrap_admin_password: config
                .get::<String>("bootstrap_admin_password")
                .ok()
                .map(Secret::new),
        })
    }

    pub fn mailer(&self) -> MailerConfig {
        MailerConfig {
            api_url: self.mail_api_url.clone(),
            api_token: self.mail_api_token.clone(),
            from: self.mail_from.clone(),
            timeout: StdDuration::from_secs(self.mail_timeout_secs),
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_ttl_hours)
    }

    pub fn challenge_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.challenge_ttl_minutes)
    }
}

/// Two-factor login needs somewhere to send its codes.
fn require_code_recipient(
    two_factor_enabled: bool,
    two_fa_email: &str,
) -> Result<(), config::ConfigError> {
    if two_factor_enabled && two_fa_email.is_empty() {
        return Err(config::ConfigError::Message(
            "TWO_FA_EMAIL is required while TWO_FACTOR_ENABLED is true".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_factor_requires_recipient() {
        assert!(require_code_recipient(true, "").is_err());
        assert!(require_code_recipient(true, "ops@example.com").is_ok());
        assert!(require_code_recipient(false, "").is_ok());
    }
}
