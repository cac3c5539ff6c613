use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ActivationGrant, AdminStore, AuditSink, ChallengeStore, DeleteLicenseOutcome, DeviceSnapshot,
    LicenseRef, LicenseStore, Page, StoreError, StoreResult,
};
use crate::models::{
    activation::{Activation, ActivationStatus},
    admin_user::{AdminUser, CreateAdminData},
    audit_log::{AuditLog, CreateAuditLogData},
    challenge::{ChallengeKind, CreateChallengeData, VerificationChallenge},
    license::{
        CreateLicenseData, License, LicenseFilter, LicenseStats, LicenseStatus, UpdateLicenseData,
    },
};

/// Postgres-backed store. Relies on row locks and the
/// `(license_id, device_hash)` unique constraint for its atomic sections.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl LicenseStore for PgStore {
    async fn create_license(&self, data: CreateLicenseData) -> StoreResult<License> {
        License::create(&self.pool, data).await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateLicenseKey
            } else {
                StoreError::Database(e)
            }
        })
    }

    async fn find_license_by_id(&self, id: Uuid) -> StoreResult<Option<License>> {
        Ok(License::find_by_id(&self.pool, id).await?)
    }

    async fn find_license_by_key(&self, license_key: &str) -> StoreResult<Option<License>> {
        Ok(License::find_by_key(&self.pool, license_key).await?)
    }

    async fn update_license(
        &self,
        id: Uuid,
        data: UpdateLicenseData,
    ) -> StoreResult<Option<License>> {
        Ok(License::update(&self.pool, id, data).await?)
    }

    async fn expire_license(&self, id: Uuid) -> StoreResult<bool> {
        Ok(License::mark_expired(&self.pool, id).await?)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        Ok(License::expire_overdue(&self.pool, now).await?)
    }

    async fn activate_device(
        &self,
        license_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ActivationGrant> {
        let mut tx = self.pool.begin().await?;

        // Serializes every activation attempt for this license until commit.
        let Some(license) = License::lock_by_id(&mut *tx, license_id).await? else {
            return Ok(ActivationGrant::LicenseMissing);
        };

        if !license.is_active() {
            return Ok(ActivationGrant::LicenseUnavailable { license });
        }

        let existing = Activation::find(&mut *tx, license_id, device_hash).await?;
        let active_devices = Activation::count_active(&mut *tx, license_id).await?;

        if existing.is_none() && active_devices >= i64::from(license.max_devices) {
            tx.rollback().await?;
            return Ok(ActivationGrant::LimitReached {
                active_devices,
                max_devices: license.max_devices,
            });
        }

        let (activation, newly_created) =
            Activation::upsert_active(&mut *tx, license_id, device_hash, now).await?;

        tx.commit().await?;

        Ok(ActivationGrant::Granted {
            activation,
            newly_created,
        })
    }

    async fn device_snapshot(
        &self,
        license: &LicenseRef,
        device_hash: &str,
    ) -> StoreResult<Option<DeviceSnapshot>> {
        let mut tx = self.pool.begin().await?;

        // Both reads must see the same commit so a concurrent revoke is
        // observed either fully or not at all.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let license = match license {
            LicenseRef::Id(id) => License::find_by_id(&mut *tx, *id).await?,
            LicenseRef::Key(key) => License::find_by_key(&mut *tx, key).await?,
        };

        let snapshot = match license {
            Some(license) => {
                let activation = Activation::find(&mut *tx, license.id, device_hash).await?;
                Some(DeviceSnapshot {
                    license,
                    activation,
                })
            }
            None => None,
        };

        tx.commit().await?;

        Ok(snapshot)
    }

    async fn touch_activation(
        &self,
        activation_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activation>> {
        Ok(Activation::touch(&self.pool, activation_id, now).await?)
    }

    async fn revoke_license(&self, id: Uuid) -> StoreResult<Option<(License, u64)>> {
        let mut tx = self.pool.begin().await?;

        let Some(license) = License::set_status(&mut *tx, id, LicenseStatus::Revoked).await? else {
            return Ok(None);
        };

        let revoked = Activation::revoke_all_for_license(&mut *tx, id).await?;

        tx.commit().await?;

        Ok(Some((license, revoked)))
    }

    async fn delete_license(&self, id: Uuid) -> StoreResult<DeleteLicenseOutcome> {
        let mut tx = self.pool.begin().await?;

        if License::lock_by_id(&mut *tx, id).await?.is_none() {
            return Ok(DeleteLicenseOutcome::NotFound);
        }

        let active_devices = Activation::count_active(&mut *tx, id).await?;
        if active_devices > 0 {
            tx.rollback().await?;
            return Ok(DeleteLicenseOutcome::HasActiveActivations { active_devices });
        }

        sqlx::query("DELETE FROM activations WHERE license_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        License::delete(&mut *tx, id).await?;

        tx.commit().await?;

        Ok(DeleteLicenseOutcome::Deleted)
    }

    async fn list_licenses(
        &self,
        filter: &LicenseFilter,
        page: Page,
    ) -> StoreResult<(Vec<License>, i64)> {
        let licenses = License::list(&self.pool, filter, page.limit, page.offset).await?;
        let total = License::count(&self.pool, filter).await?;

        Ok((licenses, total))
    }

    async fn list_activations(&self, license_id: Uuid) -> StoreResult<Vec<Activation>> {
        Ok(Activation::list_by_license(&self.pool, license_id).await?)
    }

    async fn set_activation_status(
        &self,
        activation_id: Uuid,
        status: ActivationStatus,
    ) -> StoreResult<Option<Activation>> {
        Ok(Activation::set_status(&self.pool, activation_id, status).await?)
    }

    async fn license_stats(&self) -> StoreResult<LicenseStats> {
        Ok(License::stats(&self.pool).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AdminStore for PgStore {
    async fn create_admin(&self, data: CreateAdminData) -> StoreResult<AdminUser> {
        AdminUser::create(&self.pool, data).await.map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateUsername
            } else {
                StoreError::Database(e)
            }
        })
    }

    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminUser>> {
        Ok(AdminUser::find_by_username(&self.pool, username).await?)
    }

    async fn find_admin_by_id(&self, id: Uuid) -> StoreResult<Option<AdminUser>> {
        Ok(AdminUser::find_by_id(&self.pool, id).await?)
    }

    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> StoreResult<bool> {
        Ok(AdminUser::update_password_hash(&self.pool, id, password_hash).await?)
    }
}

#[async_trait]
impl ChallengeStore for PgStore {
    async fn replace_challenge(
        &self,
        data: CreateChallengeData,
    ) -> StoreResult<VerificationChallenge> {
        let mut tx = self.pool.begin().await?;

        VerificationChallenge::delete_for_admin(&mut *tx, data.admin_id, data.kind).await?;
        let challenge = VerificationChallenge::create(&mut *tx, data).await?;

        tx.commit().await?;

        Ok(challenge)
    }

    async fn find_unused_challenge(
        &self,
        token: &str,
        kind: ChallengeKind,
    ) -> StoreResult<Option<VerificationChallenge>> {
        Ok(VerificationChallenge::find_unused(&self.pool, token, kind).await?)
    }

    async fn consume_challenge(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(VerificationChallenge::mark_used(&self.pool, id, now).await?)
    }

    async fn delete_challenge(&self, id: Uuid) -> StoreResult<()> {
        Ok(VerificationChallenge::delete(&self.pool, id).await?)
    }

    async fn delete_challenges_for(
        &self,
        admin_id: Uuid,
        kind: ChallengeKind,
    ) -> StoreResult<u64> {
        Ok(VerificationChallenge::delete_for_admin(&self.pool, admin_id, kind).await?)
    }

    async fn purge_stale_challenges(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> StoreResult<u64> {
        Ok(VerificationChallenge::purge_stale(&self.pool, now, retention).await?)
    }
}

#[async_trait]
impl AuditSink for PgStore {
    async fn append(&self, data: CreateAuditLogData) -> StoreResult<()> {
        AuditLog::create(&self.pool, data).await?;
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        license_id: Option<Uuid>,
        page: Page,
    ) -> StoreResult<Vec<AuditLog>> {
        Ok(AuditLog::list(&self.pool, license_id, page.limit, page.offset).await?)
    }
}
