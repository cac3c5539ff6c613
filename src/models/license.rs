use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, PgExecutor, Postgres, QueryBuilder};
use uuid::Uuid;

/// Feature flags granted by a license. Opaque to the validation engine.
pub type Features = BTreeMap<String, bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "license_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
    Suspended,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Expired => "expired",
            LicenseStatus::Revoked => "revoked",
            LicenseStatus::Suspended => "suspended",
        }
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub id: Uuid,
    pub license_key: String,
    pub tenant_name: String,
    pub plan: Option<String>,
    pub max_devices: i32,
    pub max_users: i32,
    pub features: Json<Features>,
    pub start_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    pub status: LicenseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The slice of a license a POS client is entitled to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseEntitlement {
    pub license_id: Uuid,
    pub tenant_name: String,
    pub features: Features,
    pub expiry_date: NaiveDate,
    pub max_devices: i32,
    pub max_users: i32,
}

impl License {
    /// The instant the license stops being valid: midnight UTC at the
    /// start of `expiry_date`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expiry_date.and_time(NaiveTime::MIN).and_utc()
    }

    /// Pure expiry test used by every read path before trusting `status`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    pub fn is_active(&self) -> bool {
        self.status == LicenseStatus::Active
    }

    pub fn entitlement(&self) -> LicenseEntitlement {
        LicenseEntitlement {
            license_id: self.id,
            tenant_name: self.tenant_name.clone(),
            features: self.features.0.clone(),
            expiry_date: self.expiry_date,
            max_devices: self.max_devices,
            max_users: self.max_users,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateLicenseData {
    pub license_key: String,
    pub tenant_name: String,
    pub plan: Option<String>,
    pub max_devices: i32,
    pub max_users: i32,
    pub features: Features,
    pub start_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLicenseData {
    pub tenant_name: Option<String>,
    pub plan: Option<String>,
    pub max_devices: Option<i32>,
    pub max_users: Option<i32>,
    pub features: Option<Features>,
    pub start_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub status: Option<LicenseStatus>,
}

impl UpdateLicenseData {
    pub fn is_empty(&self) -> bool {
        self.tenant_name.is_none()
            && self.plan.is_none()
            && self.max_devices.is_none()
            && self.max_users.is_none()
            && self.features.is_none()
            && self.start_date.is_none()
            && self.expiry_date.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseFilter {
    pub status: Option<LicenseStatus>,
    pub tenant_name: Option<String>,
    pub plan: Option<String>,
    pub license_key: Option<String>,
}

impl LicenseFilter {
    /// In-process form of the SQL filter, used by the memory store.
    pub fn matches(&self, license: &License) -> bool {
        fn contains_ci(haystack: &str, needle: &str) -> bool {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }

        self.status.map_or(true, |s| license.status == s)
            && self
                .tenant_name
                .as_deref()
                .map_or(true, |t| contains_ci(&license.tenant_name, t))
            && self
                .plan
                .as_deref()
                .map_or(true, |p| license.plan.as_deref() == Some(p))
            && self
                .license_key
                .as_deref()
                .map_or(true, |k| contains_ci(&license.license_key, k))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStats {
    pub active_licenses: i64,
    pub expired_licenses: i64,
    pub revoked_licenses: i64,
    pub suspended_licenses: i64,
    pub total_licenses: i64,
    pub active_devices: i64,
}

impl License {
    pub async fn create<'e, E: PgExecutor<'e>>(
        executor: E,
        data: CreateLicenseData,
    ) -> Result<Self, sqlx::Error> {
        let license = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO licenses (
                license_key, tenant_name, plan, max_devices, max_users,
                features, start_date, expiry_date, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active')
            RETURNING *
            "#,
        )
        .bind(&data.license_key)
        .bind(&data.tenant_name)
        .bind(&data.plan)
        .bind(data.max_devices)
        .bind(data.max_users)
        .bind(Json(&data.features))
        .bind(data.start_date)
        .bind(data.expiry_date)
        .fetch_one(executor)
        .await?;

        Ok(license)
    }

    pub async fn find_by_id<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM licenses WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    pub async fn find_by_key<'e, E: PgExecutor<'e>>(
        executor: E,
        license_key: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM licenses WHERE license_key = $1")
            .bind(license_key)
            .fetch_optional(executor)
            .await
    }

    /// Locks the license row for the rest of the surrounding transaction.
    pub async fn lock_by_id<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>("SELECT * FROM licenses WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Moves an active license to `expired`. Returns false when another
    /// caller already made the transition.
    pub async fn mark_expired<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE licenses
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Expires every active license whose expiry date has passed.
    pub async fn expire_overdue<'e, E: PgExecutor<'e>>(
        executor: E,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE licenses
            SET status = 'expired', updated_at = NOW()
            WHERE status = 'active'
              AND (expiry_date::timestamp AT TIME ZONE 'UTC') < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(executor)
        .await
    }

    pub async fn set_status<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        status: LicenseStatus,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE licenses
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_optional(executor)
        .await
    }

    pub async fn update<'e, E: PgExecutor<'e>>(
        executor: E,
        id: Uuid,
        data: UpdateLicenseData,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE licenses
            SET
                tenant_name = COALESCE($2, tenant_name),
                plan = COALESCE($3, plan),
                max_devices = COALESCE($4, max_devices),
                max_users = COALESCE($5, max_users),
                features = COALESCE($6, features),
                start_date = COALESCE($7, start_date),
                expiry_date = COALESCE($8, expiry_date),
                status = COALESCE($9, status),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(data.tenant_name)
        .bind(data.plan)
        .bind(data.max_devices)
        .bind(data.max_users)
        .bind(data.features.map(Json))
        .bind(data.start_date)
        .bind(data.expiry_date)
        .bind(data.status)
        .fetch_optional(executor)
        .await
    }

    pub async fn delete<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM licenses WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &LicenseFilter) {
        builder.push(" WHERE 1=1");
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(tenant) = &filter.tenant_name {
            builder
                .push(" AND tenant_name ILIKE ")
                .push_bind(format!("%{}%", tenant));
        }
        if let Some(plan) = &filter.plan {
            builder.push(" AND plan = ").push_bind(plan.clone());
        }
        if let Some(key) = &filter.license_key {
            builder
                .push(" AND license_key ILIKE ")
                .push_bind(format!("%{}%", key));
        }
    }

    /// Lists licenses matching `filter`, newest first.
    pub async fn list<'e, E: PgExecutor<'e>>(
        executor: E,
        filter: &LicenseFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM licenses");
        Self::push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        builder.build_query_as::<Self>().fetch_all(executor).await
    }

    pub async fn count<'e, E: PgExecutor<'e>>(
        executor: E,
        filter: &LicenseFilter,
    ) -> Result<i64, sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM licenses");
        Self::push_filter(&mut builder, filter);

        builder
            .build_query_scalar::<i64>()
            .fetch_one(executor)
            .await
    }

    pub async fn stats<'e, E: PgExecutor<'e>>(executor: E) -> Result<LicenseStats, sqlx::Error> {
        sqlx::query_as::<_, LicenseStats>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'active') AS active_licenses,
                COUNT(*) FILTER (WHERE status = 'expired') AS expired_licenses,
                COUNT(*) FILTER (WHERE status = 'revoked') AS revoked_licenses,
                COUNT(*) FILTER (WHERE status = 'suspended') AS suspended_licenses,
                COUNT(*) AS total_licenses,
                (SELECT COUNT(*) FROM activations WHERE status = 'active') AS active_devices
            FROM licenses
            "#,
        )
        .fetch_one(executor)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample(expiry_date: NaiveDate) -> License {
        let now = Utc::now();
        License {
            id: Uuid::new_v4(),
            license_key: "HK-AB12-CD34-EF56".to_string(),
            tenant_name: "Karachi Traders".to_string(),
            plan: Some("pro".to_string()),
            max_devices: 2,
            max_users: 3,
            features: Json(Features::from([("inventory".to_string(), true)])),
            start_date: None,
            expiry_date,
            status: LicenseStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_expiry_is_midnight_utc_of_expiry_date() {
        let license = sample(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());

        let just_before = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap();
        let just_after = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 1).unwrap();

        assert!(!license.is_expired_at(just_before));
        assert!(license.is_expired_at(just_after));
    }

    #[test]
    fn test_future_expiry_is_not_expired() {
        let tomorrow = (Utc::now() + Duration::days(2)).date_naive();
        assert!(!sample(tomorrow).is_expired_at(Utc::now()));
    }

    #[test]
    fn test_entitlement_carries_client_fields_only() {
        let license = sample(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap());
        let entitlement = license.entitlement();

        assert_eq!(entitlement.license_id, license.id);
        assert_eq!(entitlement.max_devices, 2);
        assert_eq!(entitlement.features.get("inventory"), Some(&true));

        let json = serde_json::to_value(&entitlement).unwrap();
        assert!(json.get("licenseKey").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_filter_matches_case_insensitive_substrings() {
        let license = sample(NaiveDate::from_ymd_opt(2030, 1, 1).unwrap());

        let filter = LicenseFilter {
            tenant_name: Some("karachi".to_string()),
            license_key: Some("cd34".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&license));

        let filter = LicenseFilter {
            status: Some(LicenseStatus::Revoked),
            ..Default::default()
        };
        assert!(!filter.matches(&license));
    }

    #[test]
    fn test_empty_update_detected() {
        assert!(UpdateLicenseData::default().is_empty());
        let patch = UpdateLicenseData {
            max_devices: Some(4),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
