use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "activation_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Active,
    Blocked,
    Revoked,
}

impl ActivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Active => "active",
            ActivationStatus::Blocked => "blocked",
            ActivationStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding of one hashed device to one license.
///
/// `(license_id, device_hash)` is unique; the raw device id is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    pub id: Uuid,
    pub license_id: Uuid,
    pub device_hash: String,
    pub activated_at: DateTime<Utc>,
    pub last_check: DateTime<Utc>,
    pub status: ActivationStatus,
}

impl Activation {
    pub async fn find<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Uuid,
        device_hash: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM activations
            WHERE license_id = $1 AND device_hash = $2
            "#,
        )
        .bind(license_id)
        .bind(device_hash)
        .fetch_optional(executor)
        .await
    }

    pub async fn count_active<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Uuid,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM activations
            WHERE license_id = $1 AND status = 'active'
            "#,
        )
        .bind(license_id)
        .fetch_one(executor)
        .await
    }

    /// Inserts the activation or, when the device is already bound,
    /// reactivates it and refreshes `last_check`. `activated_at` is kept
    /// from the first insert.
    ///
    /// The second tuple field is true when a new row was created.
    pub async fn upsert_active<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(Self, bool), sqlx::Error> {
        #[derive(FromRow)]
        struct Upserted {
            #[sqlx(flatten)]
            activation: Activation,
            inserted: bool,
        }

        let row = sqlx::query_as::<_, Upserted>(
            r#"
            INSERT INTO activations (license_id, device_hash, activated_at, last_check, status)
            VALUES ($1, $2, $3, $3, 'active')
            ON CONFLICT (license_id, device_hash)
            DO UPDATE SET status = 'active', last_check = EXCLUDED.last_check
            RETURNING *, (xmax = 0) AS inserted
            "#,
        )
        .bind(license_id)
        .bind(device_hash)
        .bind(now)
        .fetch_one(executor)
        .await?;

        Ok((row.activation, row.inserted))
    }

    /// Refreshes `last_check` only while the activation is still active.
    pub async fn touch<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE activations
            SET last_check = $2
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(executor)
        .await
    }

    pub async fn revoke_all_for_license<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE activations
            SET status = 'revoked'
            WHERE license_id = $1 AND status <> 'revoked'
            "#,
        )
        .bind(license_id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn set_status<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        status: ActivationStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE activations
            SET status = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(executor)
        .await
    }

    /// Lists a license's activations, most recently checked first.
    pub async fn list_by_license<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Uuid,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM activations
            WHERE license_id = $1
            ORDER BY last_check DESC
            "#,
        )
        .bind(license_id)
        .fetch_all(executor)
        .await
    }
}
