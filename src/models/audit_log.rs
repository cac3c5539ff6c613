use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgExecutor};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: Uuid,
    pub license_id: Option<Uuid>,
    pub action: String, // "validation_success", "login_failed", "license_revoked", ...
    pub details: JsonValue, // JSONB field
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller metadata attached to audit records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateAuditLogData {
    pub action: String,
    pub details: JsonValue,
    pub license_id: Option<Uuid>,
    pub context: RequestContext,
}

impl AuditLog {
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: CreateAuditLogData,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO audit_logs (license_id, action, details, ip_address, user_agent)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(data.license_id)
        .bind(&data.action)
        .bind(&data.details)
        .bind(&data.context.ip_address)
        .bind(&data.context.user_agent)
        .fetch_one(executor)
        .await
    }

    /// Lists audit records, newest first, optionally for one license.
    pub async fn list<'e, E: PgExecutor<'e>>(
        executor: E,
        license_id: Option<Uuid>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM audit_logs
            WHERE ($1::uuid IS NULL OR license_id = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(license_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(executor)
        .await
    }
}
