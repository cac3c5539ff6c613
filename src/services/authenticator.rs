use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::models::{
    admin_user::{AdminUser, CreateAdminData},
    audit_log::RequestContext,
    challenge::{ChallengeKind, ChallengePayload},
};
use crate::services::{
    audit::AuditRecorder,
    mailer::{CodeDispatcher, CodePurpose},
    password::{self, PasswordError},
    session_token::{SessionSigner, SessionTokenError},
    verification_code::{ChallengeError, ChallengeService, IssuedChallenge, VerifyOutcome},
};
use crate::store::{AdminStore, StoreError};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Verification channel unavailable: {0}")]
    VerificationUnavailable(String),

    #[error("Invalid or expired session. Please log in again.")]
    InvalidOrExpired,

    #[error("Code expired. Please start again.")]
    Expired,

    #[error("Invalid verification code")]
    WrongCode,

    #[error("New password must be different from the current password")]
    SamePassword,

    #[error("New password must be at least 8 characters")]
    WeakPassword,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),

    #[error("Password error: {0}")]
    Password(#[from] PasswordError),

    #[error("Session token error: {0}")]
    Session(#[from] SessionTokenError),
}

/// Handle returned when a code has been sent out of band.
#[derive(Debug, Clone)]
pub struct ChallengeHandle {
    pub token: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token: String,
    pub admin: AdminUser,
}

#[derive(Debug, Clone)]
pub enum LoginStep {
    CodeSent(ChallengeHandle),
    Authenticated(AdminSession),
}

/// What happens once the password has been accepted.
#[async_trait]
pub trait LoginStrategy: Send + Sync {
    async fn after_password(
        &self,
        admin: &AdminUser,
        context: &RequestContext,
    ) -> Result<LoginStep, AuthError>;
}

/// Sends codes through a dispatcher and ties delivery to challenge lifetime.
#[derive(Clone)]
pub struct CodeChannel {
    challenges: ChallengeService,
    dispatcher: Arc<dyn CodeDispatcher>,
    recipient: String,
}

impl CodeChannel {
    pub fn new(
        challenges: ChallengeService,
        dispatcher: Arc<dyn CodeDispatcher>,
        recipient: String,
    ) -> Self {
        Self {
            challenges,
            dispatcher,
            recipient,
        }
    }

    /// Issues a challenge and delivers its code. An undeliverable challenge
    /// is deleted before returning.
    async fn issue_and_send(
        &self,
        admin: &AdminUser,
        kind: ChallengeKind,
        payload: Option<ChallengePayload>,
    ) -> Result<ChallengeHandle, AuthError> {
        let IssuedChallenge {
            challenge_id,
            token,
            code,
            expires_at,
        } = self
            .challenges
            .issue(admin.id, kind, &self.recipient, payload)
            .await?;

        let purpose = match kind {
            ChallengeKind::Login => CodePurpose::Login,
            ChallengeKind::PasswordChange => CodePurpose::PasswordChange,
        };

        let report = self
            .dispatcher
            .send(&code, &self.recipient, &admin.username, purpose)
            .await;

        if !report.sent {
            self.challenges.discard(challenge_id).await?;
            let reason = report
                .error
                .unwrap_or_else(|| "Unknown dispatch error".to_string());
            return Err(AuthError::VerificationUnavailable(reason));
        }

        Ok(ChallengeHandle {
            token,
            email: self.recipient.clone(),
            expires_at,
        })
    }
}

/// Password, then a one-time code sent out of band.
pub struct TwoFactorLogin {
    channel: CodeChannel,
    audit: AuditRecorder,
}

impl TwoFactorLogin {
    pub fn new(channel: CodeChannel, audit: AuditRecorder) -> Self {
        Self { channel, audit }
    }
}

#[async_trait]
impl LoginStrategy for TwoFactorLogin {
    async fn after_password(
        &self,
        admin: &AdminUser,
        context: &RequestContext,
    ) -> Result<LoginStep, AuthError> {
        match self
            .channel
            .issue_and_send(admin, ChallengeKind::Login, None)
            .await
        {
            Ok(handle) => {
                self.audit
                    .record(
                        "login_2fa_sent",
                        json!({ "username": admin.username, "userId": admin.id }),
                        None,
                        context,
                    )
                    .await;
                Ok(LoginStep::CodeSent(handle))
            }
            Err(e) => {
                if let AuthError::VerificationUnavailable(reason) = &e {
                    tracing::error!(
                        admin_id = %admin.id,
                        reason = %reason,
                        "Login code dispatch failed"
                    );
                    self.audit
                        .record(
                            "login_failed",
                            json!({ "username": admin.username, "reason": "2fa_email_failed" }),
                            None,
                            context,
                        )
                        .await;
                }
                Err(e)
            }
        }
    }
}

/// Password alone mints the session. Selected with `TWO_FACTOR_ENABLED=false`.
pub struct PasswordOnlyLogin {
    sessions: SessionSigner,
    audit: AuditRecorder,
}

impl PasswordOnlyLogin {
    pub fn new(sessions: SessionSigner, audit: AuditRecorder) -> Self {
        Self { sessions, audit }
    }
}

#[async_trait]
impl LoginStrategy for PasswordOnlyLogin {
    async fn after_password(
        &self,
        admin: &AdminUser,
        context: &RequestContext,
    ) -> Result<LoginStep, AuthError> {
        let token = self.sessions.issue(admin)?;
        self.audit
            .record(
                "login_success",
                json!({ "username": admin.username, "userId": admin.id, "twoFA": false }),
                None,
                context,
            )
            .await;

        Ok(LoginStep::Authenticated(AdminSession {
            token,
            admin: admin.clone(),
        }))
    }
}

/// Admin login and password change, both gated by a verification code.
#[derive(Clone)]
pub struct AdminAuthenticator {
    admins: Arc<dyn AdminStore>,
    strategy: Arc<dyn LoginStrategy>,
    challenges: ChallengeService,
    channel: CodeChannel,
    sessions: SessionSigner,
    audit: AuditRecorder,
}

impl AdminAuthenticator {
    pub fn new(
        admins: Arc<dyn AdminStore>,
        strategy: Arc<dyn LoginStrategy>,
        channel: CodeChannel,
        sessions: SessionSigner,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            admins,
            strategy,
            challenges: channel.challenges.clone(),
            channel,
            sessions,
            audit,
        }
    }

    pub fn sessions(&self) -> &SessionSigner {
        &self.sessions
    }

    /// Unknown user and wrong password look the same to the caller; the
    /// audit trail records which one it was.
    #[tracing::instrument(skip(self, password, context))]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        context: &RequestContext,
    ) -> Result<LoginStep, AuthError> {
        let Some(admin) = self.admins.find_admin_by_username(username).await? else {
            self.record_login_failure(username, "user_not_found", context)
                .await;
            return Err(AuthError::InvalidCredentials);
        };

        let matches = match password::verify_password(password, &admin.password_hash) {
            Ok(matches) => matches,
            Err(e) => {
                tracing::error!(
                    admin_id = %admin.id,
                    error = %e,
                    "Stored password hash is unusable"
                );
                self.record_login_failure(username, "password_hash_invalid", context)
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !matches {
            self.record_login_failure(username, "invalid_password", context)
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        self.strategy.after_password(&admin, context).await
    }

    pub async fn complete_login(
        &self,
        token: &str,
        code: &str,
        context: &RequestContext,
    ) -> Result<AdminSession, AuthError> {
        self.complete_login_at(token, code, context, Utc::now())
            .await
    }

    #[tracing::instrument(skip(self, token, code, context))]
    pub async fn complete_login_at(
        &self,
        token: &str,
        code: &str,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<AdminSession, AuthError> {
        let outcome = self
            .challenges
            .verify_at(token, code, ChallengeKind::Login, None, now)
            .await?;

        let admin_id = match outcome {
            VerifyOutcome::Success { admin_id, .. } => admin_id,
            failure => {
                let error = failure_to_error(failure);
                self.audit
                    .record(
                        "login_2fa_failed",
                        json!({ "reason": failure_reason(&error) }),
                        None,
                        context,
                    )
                    .await;
                return Err(error);
            }
        };

        let Some(admin) = self.admins.find_admin_by_id(admin_id).await? else {
            return Err(AuthError::InvalidOrExpired);
        };

        let session = self.sessions.issue_at(&admin, now)?;
        tracing::info!(admin_id = %admin.id, "Admin logged in");
        self.audit
            .record(
                "login_success",
                json!({ "username": admin.username, "userId": admin.id, "twoFA": true }),
                None,
                context,
            )
            .await;

        Ok(AdminSession {
            token: session,
            admin,
        })
    }

    /// Re-checks the current password and sends a code confirming the
    /// change. The new password only ever leaves here as a hash.
    #[tracing::instrument(skip(self, current_password, new_password, context))]
    pub async fn request_password_change(
        &self,
        admin_id: Uuid,
        current_password: &str,
        new_password: &str,
        context: &RequestContext,
    ) -> Result<ChallengeHandle, AuthError> {
        let Some(admin) = self.admins.find_admin_by_id(admin_id).await? else {
            return Err(AuthError::InvalidCredentials);
        };

        if !password::verify_password(current_password, &admin.password_hash)? {
            self.audit
                .record(
                    "password_change_failed",
                    json!({ "userId": admin.id, "reason": "invalid_current_password" }),
                    None,
                    context,
                )
                .await;
            return Err(AuthError::InvalidCredentials);
        }

        if new_password == current_password {
            return Err(AuthError::SamePassword);
        }

        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let payload = ChallengePayload::PasswordChange {
            new_password_hash: password::hash_password(new_password)?,
        };

        let handle = match self
            .channel
            .issue_and_send(&admin, ChallengeKind::PasswordChange, Some(payload))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if let AuthError::VerificationUnavailable(reason) = &e {
                    tracing::error!(
                        admin_id = %admin.id,
                        reason = %reason,
                        "Password change code dispatch failed"
                    );
                    self.audit
                        .record(
                            "password_change_failed",
                            json!({ "userId": admin.id, "reason": "2fa_email_failed" }),
                            None,
                            context,
                        )
                        .await;
                }
                return Err(e);
            }
        };

        self.audit
            .record(
                "password_change_2fa_sent",
                json!({ "username": admin.username, "userId": admin.id }),
                None,
                context,
            )
            .await;

        Ok(handle)
    }

    pub async fn complete_password_change(
        &self,
        admin_id: Uuid,
        token: &str,
        code: &str,
        context: &RequestContext,
    ) -> Result<(), AuthError> {
        self.complete_password_change_at(admin_id, token, code, context, Utc::now())
            .await
    }

    #[tracing::instrument(skip(self, token, code, context))]
    pub async fn complete_password_change_at(
        &self,
        admin_id: Uuid,
        token: &str,
        code: &str,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let outcome = self
            .challenges
            .verify_at(token, code, ChallengeKind::PasswordChange, Some(admin_id), now)
            .await?;

        let payload = match outcome {
            VerifyOutcome::Success { payload, .. } => payload,
            failure => {
                let error = failure_to_error(failure);
                self.audit
                    .record(
                        "password_change_failed",
                        json!({ "userId": admin_id, "reason": failure_reason(&error) }),
                        None,
                        context,
                    )
                    .await;
                return Err(error);
            }
        };

        let Some(ChallengePayload::PasswordChange { new_password_hash }) = payload else {
            tracing::error!(%admin_id, "Password change challenge carried no payload");
            return Err(AuthError::InvalidOrExpired);
        };

        if !self
            .admins
            .update_admin_password(admin_id, &new_password_hash)
            .await?
        {
            return Err(AuthError::InvalidOrExpired);
        }

        let cleared = self
            .challenges
            .revoke_outstanding(admin_id, ChallengeKind::PasswordChange)
            .await?;

        tracing::info!(%admin_id, cleared, "Admin password changed");
        self.audit
            .record(
                "password_changed",
                json!({ "userId": admin_id }),
                None,
                context,
            )
            .await;

        Ok(())
    }

    async fn record_login_failure(
        &self,
        username: &str,
        reason: &str,
        context: &RequestContext,
    ) {
        self.audit
            .record(
                "login_failed",
                json!({ "username": username, "reason": reason }),
                None,
                context,
            )
            .await;
    }
}

fn failure_to_error(outcome: VerifyOutcome) -> AuthError {
    match outcome {
        VerifyOutcome::Expired => AuthError::Expired,
        VerifyOutcome::WrongCode => AuthError::WrongCode,
        VerifyOutcome::InvalidOrExpired | VerifyOutcome::Success { .. } => {
            AuthError::InvalidOrExpired
        }
    }
}

fn failure_reason(error: &AuthError) -> &'static str {
    match error {
        AuthError::Expired => "expired",
        AuthError::WrongCode => "wrong_code",
        _ => "invalid_or_used_token",
    }
}

/// Creates the first superadmin when no account of that name exists.
/// Returns the new admin, or `None` when the username is already taken.
#[tracing::instrument(skip(admins, password))]
pub async fn bootstrap_admin(
    admins: &dyn AdminStore,
    username: &str,
    password: &str,
) -> Result<Option<AdminUser>, AuthError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::WeakPassword);
    }

    if admins.find_admin_by_username(username).await?.is_some() {
        tracing::debug!("Bootstrap admin already present");
        return Ok(None);
    }

    let created = admins
        .create_admin(CreateAdminData {
            username: username.to_string(),
            password_hash: password::hash_password(password)?,
            role: "superadmin".to_string(),
        })
        .await;

    match created {
        Ok(admin) => {
            tracing::info!(admin_id = %admin.id, "Bootstrap admin created");
            Ok(Some(admin))
        }
        Err(StoreError::DuplicateUsername) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::mailer::DispatchReport;
    use crate::services::session_token::DEFAULT_SESSION_TTL_HOURS;
    use crate::store::{ChallengeStore, MemoryStore};
    use chrono::Duration;
    use secrecy::Secret;
    use tokio::sync::Mutex;

    /// Captures the last code instead of mailing it.
    #[derive(Default)]
    struct RecordingDispatcher {
        last_code: Mutex<Option<String>>,
        fail: bool,
    }

    #[async_trait]
    impl CodeDispatcher for RecordingDispatcher {
        async fn send(
            &self,
            code: &str,
            _recipient: &str,
            _username: &str,
            _purpose: CodePurpose,
        ) -> DispatchReport {
            if self.fail {
                return DispatchReport::failed("relay down");
            }
            *self.last_code.lock().await = Some(code.to_string());
            DispatchReport::sent()
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        dispatcher: Arc<RecordingDispatcher>,
        auth: AdminAuthenticator,
        admin: AdminUser,
    }

    async fn harness(two_factor: bool, fail_dispatch: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let admin = store
            .create_admin(CreateAdminData {
                username: "alice".to_string(),
                password_hash: password::hash_password("P1-password").unwrap(),
                role: "superadmin".to_string(),
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(RecordingDispatcher {
            fail: fail_dispatch,
            ..Default::default()
        });
        let audit = AuditRecorder::new(store.clone());
        let sessions = SessionSigner::new(
            Secret::new("test-secret".to_string()),
            Duration::hours(DEFAULT_SESSION_TTL_HOURS),
        );
        let channel = CodeChannel::new(
            ChallengeService::new(store.clone(), Duration::minutes(10)),
            dispatcher.clone(),
            "ops@example.com".to_string(),
        );
        let strategy: Arc<dyn LoginStrategy> = if two_factor {
            Arc::new(TwoFactorLogin::new(channel.clone(), audit.clone()))
        } else {
            Arc::new(PasswordOnlyLogin::new(sessions.clone(), audit.clone()))
        };

        let auth = AdminAuthenticator::new(store.clone(), strategy, channel, sessions, audit);

        Harness {
            store,
            dispatcher,
            auth,
            admin,
        }
    }

    async fn last_code(h: &Harness) -> String {
        h.dispatcher.last_code.lock().await.clone().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_user_and_wrong_password_look_alike() {
        let h = harness(true, false).await;
        let ctx = RequestContext::default();

        let unknown = h.auth.login("mallory", "P1-password", &ctx).await;
        let wrong = h.auth.login("alice", "nope", &ctx).await;

        assert!(matches!(unknown, Err(AuthError::InvalidCredentials)));
        assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_two_factor_login_round_trip() {
        let h = harness(true, false).await;
        let ctx = RequestContext::default();

        let step = h.auth.login("alice", "P1-password", &ctx).await.unwrap();
        let LoginStep::CodeSent(handle) = step else {
            panic!("expected a code step");
        };
        assert_eq!(handle.email, "ops@example.com");

        let code = last_code(&h).await;
        let session = h.auth.complete_login(&handle.token, &code, &ctx).await.unwrap();
        let claims = h.auth.sessions().decode(&session.token).unwrap();
        assert_eq!(claims.sub, h.admin.id);
        assert_eq!(claims.role, "superadmin");
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_distinct_and_leaves_no_challenge() {
        let h = harness(true, true).await;

        let result = h
            .auth
            .login("alice", "P1-password", &RequestContext::default())
            .await;

        assert!(matches!(result, Err(AuthError::VerificationUnavailable(_))));
        assert_eq!(
            h.store
                .purge_stale_challenges(Utc::now() + Duration::days(365), Duration::zero())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_password_only_strategy_skips_code() {
        let h = harness(false, false).await;

        let step = h
            .auth
            .login("alice", "P1-password", &RequestContext::default())
            .await
            .unwrap();

        assert!(matches!(step, LoginStep::Authenticated(_)));
        assert!(h.dispatcher.last_code.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_same_password_rejected_before_any_code() {
        let h = harness(true, false).await;

        let result = h
            .auth
            .request_password_change(
                h.admin.id,
                "P1-password",
                "P1-password",
                &RequestContext::default(),
            )
            .await;

        assert!(matches!(result, Err(AuthError::SamePassword)));
        assert!(h.dispatcher.last_code.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_password_change_round_trip() {
        let h = harness(true, false).await;
        let ctx = RequestContext::default();

        let handle = h
            .auth
            .request_password_change(h.admin.id, "P1-password", "P2-password", &ctx)
            .await
            .unwrap();
        let code = last_code(&h).await;

        h.auth
            .complete_password_change(h.admin.id, &handle.token, &code, &ctx)
            .await
            .unwrap();

        let stored = h.store.find_admin_by_id(h.admin.id).await.unwrap().unwrap();
        assert!(password::verify_password("P2-password", &stored.password_hash).unwrap());
        assert!(matches!(
            h.auth.login("alice", "P1-password", &ctx).await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_password_change_scoped_to_session_admin() {
        let h = harness(true, false).await;
        let ctx = RequestContext::default();

        let handle = h
            .auth
            .request_password_change(h.admin.id, "P1-password", "P2-password", &ctx)
            .await
            .unwrap();
        let code = last_code(&h).await;

        let result = h
            .auth
            .complete_password_change(Uuid::new_v4(), &handle.token, &code, &ctx)
            .await;
        assert!(matches!(result, Err(AuthError::InvalidOrExpired)));

        let stored = h.store.find_admin_by_id(h.admin.id).await.unwrap().unwrap();
        assert!(password::verify_password("P1-password", &stored.password_hash).unwrap());
    }

    #[tokio::test]
    async fn test_short_new_password_rejected() {
        let h = harness(true, false).await;

        let result = h
            .auth
            .request_password_change(
                h.admin.id,
                "P1-password",
                "short",
                &RequestContext::default(),
            )
            .await;

        assert!(matches!(result, Err(AuthError::WeakPassword)));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_superadmin_once() {
        let store = MemoryStore::new();

        let created = bootstrap_admin(&store, " root ", "initial-pass")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.username, "root");
        assert_eq!(created.role, "superadmin");

        let again = bootstrap_admin(&store, "root", "other-password").await.unwrap();
        assert!(again.is_none());

        let stored = store.find_admin_by_username("root").await.unwrap().unwrap();
        assert!(password::verify_password("initial-pass", &stored.password_hash).unwrap());
    }
}
