use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::models::challenge::{
    ChallengeKind, ChallengePayload, CreateChallengeData, VerificationChallenge,
};
use crate::store::{ChallengeStore, StoreError};

pub const DEFAULT_CHALLENGE_TTL_MINUTES: i64 = 10;

const TOKEN_BYTES: usize = 32;
const CODE_SPACE: u32 = 1_000_000;
// Largest multiple of CODE_SPACE that fits in a u32.
const CODE_ACCEPT_BELOW: u32 = (u32::MAX / CODE_SPACE) * CODE_SPACE;

#[derive(thiserror::Error, Debug)]
pub enum ChallengeError {
    #[error("Challenge store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Random number generator failure")]
    Random,
}

/// What `issue` hands back. The token goes to the client; the code goes out
/// of band only.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub challenge_id: Uuid,
    pub token: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Success {
        admin_id: Uuid,
        payload: Option<ChallengePayload>,
    },
    InvalidOrExpired,
    Expired,
    WrongCode,
}

/// Issues and checks time-boxed single-use verification codes.
#[derive(Clone)]
pub struct ChallengeService {
    store: Arc<dyn ChallengeStore>,
    ttl: Duration,
    rng: SystemRandom,
}

impl ChallengeService {
    pub fn new(store: Arc<dyn ChallengeStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            rng: SystemRandom::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn issue(
        &self,
        admin_id: Uuid,
        kind: ChallengeKind,
        email: &str,
        payload: Option<ChallengePayload>,
    ) -> Result<IssuedChallenge, ChallengeError> {
        self.issue_at(admin_id, kind, email, payload, Utc::now())
            .await
    }

    /// Replaces any outstanding challenge of the same admin and kind.
    #[tracing::instrument(skip(self, email, payload))]
    pub async fn issue_at(
        &self,
        admin_id: Uuid,
        kind: ChallengeKind,
        email: &str,
        payload: Option<ChallengePayload>,
        now: DateTime<Utc>,
    ) -> Result<IssuedChallenge, ChallengeError> {
        let token = self.generate_token()?;
        let code = self.generate_code()?;
        let expires_at = now + self.ttl;

        let challenge = self
            .store
            .replace_challenge(CreateChallengeData {
                token,
                admin_id,
                kind,
                code,
                email: email.to_string(),
                payload,
                expires_at,
            })
            .await?;

        tracing::debug!(challenge_id = %challenge.id, %expires_at, "Verification challenge issued");

        Ok(IssuedChallenge {
            challenge_id: challenge.id,
            token: challenge.token,
            code: challenge.code,
            expires_at,
        })
    }

    pub async fn verify(
        &self,
        token: &str,
        submitted_code: &str,
        kind: ChallengeKind,
        expected_admin: Option<Uuid>,
    ) -> Result<VerifyOutcome, ChallengeError> {
        self.verify_at(token, submitted_code, kind, expected_admin, Utc::now())
            .await
    }

    /// Checks a submitted code. A challenge owned by someone other than
    /// `expected_admin` is reported as unknown and left untouched.
    #[tracing::instrument(skip(self, token, submitted_code))]
    pub async fn verify_at(
        &self,
        token: &str,
        submitted_code: &str,
        kind: ChallengeKind,
        expected_admin: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome, ChallengeError> {
        let Some(challenge) = self.store.find_unused_challenge(token, kind).await? else {
            return Ok(VerifyOutcome::InvalidOrExpired);
        };

        if expected_admin.is_some_and(|admin_id| admin_id != challenge.admin_id) {
            tracing::warn!(challenge_id = %challenge.id, "Challenge presented by a different admin");
            return Ok(VerifyOutcome::InvalidOrExpired);
        }

        if challenge.is_expired_at(now) {
            self.store.consume_challenge(challenge.id, now).await?;
            return Ok(VerifyOutcome::Expired);
        }

        if !codes_match(&challenge.code, submitted_code) {
            return Ok(VerifyOutcome::WrongCode);
        }

        if !self.store.consume_challenge(challenge.id, now).await? {
            // Another submission consumed it first.
            return Ok(VerifyOutcome::InvalidOrExpired);
        }

        let VerificationChallenge {
            admin_id, payload, ..
        } = challenge;

        Ok(VerifyOutcome::Success {
            admin_id,
            payload: payload.map(|p| p.0),
        })
    }

    /// Removes a challenge whose code could not be delivered.
    pub async fn discard(&self, challenge_id: Uuid) -> Result<(), ChallengeError> {
        self.store.delete_challenge(challenge_id).await?;
        Ok(())
    }

    pub async fn revoke_outstanding(
        &self,
        admin_id: Uuid,
        kind: ChallengeKind,
    ) -> Result<u64, ChallengeError> {
        Ok(self.store.delete_challenges_for(admin_id, kind).await?)
    }

    fn generate_token(&self) -> Result<String, ChallengeError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng.fill(&mut bytes).map_err(|_| ChallengeError::Random)?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Uniform over 000000..=999999, leading zeros kept.
    fn generate_code(&self) -> Result<String, ChallengeError> {
        loop {
            let mut bytes = [0u8; 4];
            self.rng.fill(&mut bytes).map_err(|_| ChallengeError::Random)?;
            let value = u32::from_be_bytes(bytes);
            if value < CODE_ACCEPT_BELOW {
                return Ok(format!("{:06}", value % CODE_SPACE));
            }
        }
    }
}

fn codes_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}
