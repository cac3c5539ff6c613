use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, PgExecutor};
use uuid::Uuid;

/// Which admin flow a verification challenge gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "challenge_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Login,
    PasswordChange,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Login => "login",
            ChallengeKind::PasswordChange => "password_change",
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data released to the caller once the challenge is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengePayload {
    /// Argon2 PHC string of the requested new password. Never the clear text.
    PasswordChange { new_password_hash: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VerificationChallenge {
    pub id: Uuid,
    pub token: String,
    pub admin_id: Uuid,
    pub kind: ChallengeKind,
    #[serde(skip_serializing)]
    pub code: String,
    pub email: String,
    pub payload: Option<Json<ChallengePayload>>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateChallengeData {
    pub token: String,
    pub admin_id: Uuid,
    pub kind: ChallengeKind,
    pub code: String,
    pub email: String,
    pub payload: Option<ChallengePayload>,
    pub expires_at: DateTime<Utc>,
}

impl VerificationChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: CreateChallengeData,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO verification_challenges (
                token, admin_id, kind, code, email, payload, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&data.token)
        .bind(data.admin_id)
        .bind(data.kind)
        .bind(&data.code)
        .bind(&data.email)
        .bind(data.payload.map(Json))
        .bind(data.expires_at)
        .fetch_one(executor)
        .await
    }

    /// Finds a challenge that has not been consumed yet.
    pub async fn find_unused<'e, E: PgExecutor<'e>>(
        executor: E,
        token: &str,
        kind: ChallengeKind,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM verification_challenges
            WHERE token = $1 AND kind = $2 AND used_at IS NULL
            "#,
        )
        .bind(token)
        .bind(kind)
        .fetch_optional(executor)
        .await
    }

    /// Marks the challenge used. Only the first caller wins; later calls
    /// return false.
    pub async fn mark_used<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE verification_challenges
            SET used_at = $2
            WHERE id = $1 AND used_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM verification_challenges WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(())
    }

    pub async fn delete_for_admin<'e, E: PgExecutor<'e>>(
        executor: E,
        admin_id: Uuid,
        kind: ChallengeKind,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            DELETE FROM verification_challenges
            WHERE admin_id = $1 AND kind = $2
            "#,
        )
        .bind(admin_id)
        .bind(kind)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes challenges that were used or expired before `now - retention`.
    pub async fn purge_stale<'e, E: PgExecutor<'e>>(
        executor: E,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<u64, sqlx::Error> {
        let cutoff = now - retention;

        let result = sqlx::query(
            r#"
            DELETE FROM verification_challenges
            WHERE used_at < $1 OR expires_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_tagged() {
        let payload = ChallengePayload::PasswordChange {
            new_password_hash: "$argon2id$v=19$...".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["type"], "password_change");
        assert_eq!(json["new_password_hash"], "$argon2id$v=19$...");
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ChallengeKind::Login.to_string(), "login");
        assert_eq!(ChallengeKind::PasswordChange.to_string(), "password_change");
    }
}
