use std::sync::Arc;

use crate::config::Config;
use crate::services::{
    audit::AuditRecorder,
    authenticator::{
        AdminAuthenticator, CodeChannel, LoginStrategy, PasswordOnlyLogin, TwoFactorLogin,
    },
    license_admin::LicenseAdmin,
    license_validator::LicenseValidator,
    mailer::CodeDispatcher,
    session_token::SessionSigner,
    verification_code::ChallengeService,
};
use crate::store::{LicenseStore, Store};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LicenseStore>,
    pub validator: LicenseValidator,
    pub licenses: LicenseAdmin,
    pub authenticator: AdminAuthenticator,
}

impl AppState {
    /// Wires every service onto one backend.
    pub fn new<S>(store: Arc<S>, dispatcher: Arc<dyn CodeDispatcher>, config: &Config) -> Self
    where
        S: Store + 'static,
    {
        let audit = AuditRecorder::new(store.clone());
        let sessions = SessionSigner::new(config.jwt_secret.clone(), config.session_ttl());
        let challenges = ChallengeService::new(store.clone(), config.challenge_ttl());
        let channel = CodeChannel::new(challenges, dispatcher, config.two_fa_email.clone());

        let strategy: Arc<dyn LoginStrategy> = if config.two_factor_enabled {
            Arc::new(TwoFactorLogin::new(channel.clone(), audit.clone()))
        } else {
            tracing::warn!("Two-factor login disabled; passwords alone grant sessions");
            Arc::new(PasswordOnlyLogin::new(sessions.clone(), audit.clone()))
        };

        Self {
            store: store.clone(),
            validator: LicenseValidator::new(store.clone(), audit.clone()),
            licenses: LicenseAdmin::new(store.clone(), store.clone(), audit.clone()),
            authenticator: AdminAuthenticator::new(store, strategy, channel, sessions, audit),
        }
    }
}
