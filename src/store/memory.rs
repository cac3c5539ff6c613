//! In-process store for tests and `STORE_BACKEND=memory` development runs.
//!
//! A single async mutex guards all tables, so every trait method is one
//! atomic section, matching the transactional guarantees of `PgStore`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use tokio::sync::Mutex;
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

#[derive(Default)]
struct Tables {
    licenses: HashMap<Uuid, License>,
    activations: HashMap<Uuid, Activation>,
    admins: HashMap<Uuid, AdminUser>,
    challenges: HashMap<Uuid, VerificationChallenge>,
    audit_logs: Vec<AuditLog>,
}

impl Tables {
    fn license_by_key(&self, key: &str) -> Option<&License> {
        self.licenses.values().find(|l| l.license_key == key)
    }

    fn activation_for(&self, license_id: Uuid, device_hash: &str) -> Option<&Activation> {
        self.activations
            .values()
            .find(|a| a.license_id == license_id && a.device_hash == device_hash)
    }

    fn count_active(&self, license_id: Uuid) -> i64 {
        self.activations
            .values()
            .filter(|a| a.license_id == license_id && a.status == ActivationStatus::Active)
            .count() as i64
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LicenseStore for MemoryStore {
    async fn create_license(&self, data: CreateLicenseData) -> StoreResult<License> {
        let mut tables = self.tables.lock().await;
        if tables.license_by_key(&data.license_key).is_some() {
            return Err(StoreError::DuplicateLicenseKey);
        }

        let now = Utc::now();
        let license = License {
            id: Uuid::new_v4(),
            license_key: data.license_key,
            tenant_name: data.tenant_name,
            plan: data.plan,
            max_devices: data.max_devices,
            max_users: data.max_users,
            features: Json(data.features),
            start_date: data.start_date,
            expiry_date: data.expiry_date,
            status: LicenseStatus::Active,
            created_at: now,
            updated_at: now,
        };
        tables.licenses.insert(license.id, license.clone());

        Ok(license)
    }

    async fn find_license_by_id(&self, id: Uuid) -> StoreResult<Option<License>> {
        Ok(self.tables.lock().await.licenses.get(&id).cloned())
    }

    async fn find_license_by_key(&self, license_key: &str) -> StoreResult<Option<License>> {
        Ok(self.tables.lock().await.license_by_key(license_key).cloned())
    }

    async fn update_license(
        &self,
        id: Uuid,
        data: UpdateLicenseData,
    ) -> StoreResult<Option<License>> {
        let mut tables = self.tables.lock().await;
        let Some(license) = tables.licenses.get_mut(&id) else {
            return Ok(None);
        };

        if let Some(tenant_name) = data.tenant_name {
            license.tenant_name = tenant_name;
        }
        if let Some(plan) = data.plan {
            license.plan = Some(plan);
        }
        if let Some(max_devices) = data.max_devices {
            license.max_devices = max_devices;
        }
        if let Some(max_users) = data.max_users {
            license.max_users = max_users;
        }
        if let Some(features) = data.features {
            license.features = Json(features);
        }
        if let Some(start_date) = data.start_date {
            license.start_date = Some(start_date);
        }
        if let Some(expiry_date) = data.expiry_date {
            license.expiry_date = expiry_date;
        }
        if let Some(status) = data.status {
            license.status = status;
        }
        license.updated_at = Utc::now();

        Ok(Some(license.clone()))
    }

    async fn expire_license(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.licenses.get_mut(&id) {
            Some(license) if license.status == LicenseStatus::Active => {
                license.status = LicenseStatus::Expired;
                license.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let mut tables = self.tables.lock().await;
        let mut expired = Vec::new();

        for license in tables.licenses.values_mut() {
            if license.is_active() && license.is_expired_at(now) {
                license.status = LicenseStatus::Expired;
                license.updated_at = now;
                expired.push(license.id);
            }
        }

        Ok(expired)
    }

    async fn activate_device(
        &self,
        license_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ActivationGrant> {
        let mut tables = self.tables.lock().await;

        let Some(license) = tables.licenses.get(&license_id).cloned() else {
            return Ok(ActivationGrant::LicenseMissing);
        };

        if !license.is_active() {
            return Ok(ActivationGrant::LicenseUnavailable { license });
        }

        let existing = tables.activation_for(license_id, device_hash).map(|a| a.id);
        let active_devices = tables.count_active(license_id);

        if existing.is_none() && active_devices >= i64::from(license.max_devices) {
            return Ok(ActivationGrant::LimitReached {
                active_devices,
                max_devices: license.max_devices,
            });
        }

        let grant = match existing.and_then(|id| tables.activations.get_mut(&id)) {
            Some(activation) => {
                activation.status = ActivationStatus::Active;
                activation.last_check = now;
                ActivationGrant::Granted {
                    activation: activation.clone(),
                    newly_created: false,
                }
            }
            None => {
                let activation = Activation {
                    id: Uuid::new_v4(),
                    license_id,
                    device_hash: device_hash.to_string(),
                    activated_at: now,
                    last_check: now,
                    status: ActivationStatus::Active,
                };
                tables.activations.insert(activation.id, activation.clone());
                ActivationGrant::Granted {
                    activation,
                    newly_created: true,
                }
            }
        };

        Ok(grant)
    }

    async fn device_snapshot(
        &self,
        license: &LicenseRef,
        device_hash: &str,
    ) -> StoreResult<Option<DeviceSnapshot>> {
        let tables = self.tables.lock().await;

        let license = match license {
            LicenseRef::Id(id) => tables.licenses.get(id),
            LicenseRef::Key(key) => tables.license_by_key(key),
        };

        Ok(license.map(|license| DeviceSnapshot {
            license: license.clone(),
            activation: tables.activation_for(license.id, device_hash).cloned(),
        }))
    }

    async fn touch_activation(
        &self,
        activation_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activation>> {
        let mut tables = self.tables.lock().await;
        match tables.activations.get_mut(&activation_id) {
            Some(activation) if activation.status == ActivationStatus::Active => {
                activation.last_check = now;
                Ok(Some(activation.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_license(&self, id: Uuid) -> StoreResult<Option<(License, u64)>> {
        let mut tables = self.tables.lock().await;

        let license = match tables.licenses.get_mut(&id) {
            Some(license) => {
                license.status = LicenseStatus::Revoked;
                license.updated_at = Utc::now();
                license.clone()
            }
            None => return Ok(None),
        };

        let mut revoked = 0;
        for activation in tables.activations.values_mut() {
            if activation.license_id == id && activation.status != ActivationStatus::Revoked {
                activation.status = ActivationStatus::Revoked;
                revoked += 1;
            }
        }

        Ok(Some((license, revoked)))
    }

    async fn delete_license(&self, id: Uuid) -> StoreResult<DeleteLicenseOutcome> {
        let mut tables = self.tables.lock().await;

        if !tables.licenses.contains_key(&id) {
            return Ok(DeleteLicenseOutcome::NotFound);
        }

        let active_devices = tables.count_active(id);
        if active_devices > 0 {
            return Ok(DeleteLicenseOutcome::HasActiveActivations { active_devices });
        }

        tables.activations.retain(|_, a| a.license_id != id);
        tables.licenses.remove(&id);

        Ok(DeleteLicenseOutcome::Deleted)
    }

    async fn list_licenses(
        &self,
        filter: &LicenseFilter,
        page: Page,
    ) -> StoreResult<(Vec<License>, i64)> {
        let tables = self.tables.lock().await;

        let mut matching: Vec<License> = tables
            .licenses
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();

        Ok((items, total))
    }

    async fn list_activations(&self, license_id: Uuid) -> StoreResult<Vec<Activation>> {
        let tables = self.tables.lock().await;

        let mut activations: Vec<Activation> = tables
            .activations
            .values()
            .filter(|a| a.license_id == license_id)
            .cloned()
            .collect();
        activations.sort_by(|a, b| b.last_check.cmp(&a.last_check));

        Ok(activations)
    }

    async fn set_activation_status(
        &self,
        activation_id: Uuid,
        status: ActivationStatus,
    ) -> StoreResult<Option<Activation>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.activations.get_mut(&activation_id).map(|a| {
            a.status = status;
            a.clone()
        }))
    }

    async fn license_stats(&self) -> StoreResult<LicenseStats> {
        let tables = self.tables.lock().await;
        let count = |status: LicenseStatus| {
            tables
                .licenses
                .values()
                .filter(|l| l.status == status)
                .count() as i64
        };

        Ok(LicenseStats {
            active_licenses: count(LicenseStatus::Active),
            expired_licenses: count(LicenseStatus::Expired),
            revoked_licenses: count(LicenseStatus::Revoked),
            suspended_licenses: count(LicenseStatus::Suspended),
            total_licenses: tables.licenses.len() as i64,
            active_devices: tables
                .activations
                .values()
                .filter(|a| a.status == ActivationStatus::Active)
                .count() as i64,
        })
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl AdminStore for MemoryStore {
    async fn create_admin(&self, data: CreateAdminData) -> StoreResult<AdminUser> {
        let mut tables = self.tables.lock().await;
        if tables.admins.values().any(|a| a.username == data.username) {
            return Err(StoreError::DuplicateUsername);
        }

        let now = Utc::now();
        let admin = AdminUser {
            id: Uuid::new_v4(),
            username: data.username,
            password_hash: data.password_hash,
            role: data.role,
            created_at: now,
            updated_at: now,
        };
        tables.admins.insert(admin.id, admin.clone());

        Ok(admin)
    }

    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminUser>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .admins
            .values()
            .find(|a| a.username == username)
            .cloned())
    }

    async fn find_admin_by_id(&self, id: Uuid) -> StoreResult<Option<AdminUser>> {
        Ok(self.tables.lock().await.admins.get(&id).cloned())
    }

    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.admins.get_mut(&id) {
            Some(admin) => {
                admin.password_hash = password_hash.to_string();
                admin.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl ChallengeStore for MemoryStore {
    async fn replace_challenge(
        &self,
        data: CreateChallengeData,
    ) -> StoreResult<VerificationChallenge> {
        let mut tables = self.tables.lock().await;

        tables
            .challenges
            .retain(|_, c| !(c.admin_id == data.admin_id && c.kind == data.kind));

        let challenge = VerificationChallenge {
            id: Uuid::new_v4(),
            token: data.token,
            admin_id: data.admin_id,
            kind: data.kind,
            code: data.code,
            email: data.email,
            payload: data.payload.map(Json),
            expires_at: data.expires_at,
            used_at: None,
            created_at: Utc::now(),
        };
        tables.challenges.insert(challenge.id, challenge.clone());

        Ok(challenge)
    }

    async fn find_unused_challenge(
        &self,
        token: &str,
        kind: ChallengeKind,
    ) -> StoreResult<Option<VerificationChallenge>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .challenges
            .values()
            .find(|c| c.token == token && c.kind == kind && c.used_at.is_none())
            .cloned())
    }

    async fn consume_challenge(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.challenges.get_mut(&id) {
            Some(challenge) if challenge.used_at.is_none() => {
                challenge.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_challenge(&self, id: Uuid) -> StoreResult<()> {
        self.tables.lock().await.challenges.remove(&id);
        Ok(())
    }

    async fn delete_challenges_for(
        &self,
        admin_id: Uuid,
        kind: ChallengeKind,
    ) -> StoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.challenges.len();
        tables
            .challenges
            .retain(|_, c| !(c.admin_id == admin_id && c.kind == kind));

        Ok((before - tables.challenges.len()) as u64)
    }

    async fn purge_stale_challenges(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> StoreResult<u64> {
        let cutoff = now - retention;
        let mut tables = self.tables.lock().await;
        let before = tables.challenges.len();
        tables.challenges.retain(|_, c| {
            let used_long_ago = c.used_at.map_or(false, |used| used < cutoff);
            !(used_long_ago || c.expires_at < cutoff)
        });

        Ok((before - tables.challenges.len()) as u64)
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append(&self, data: CreateAuditLogData) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.audit_logs.push(AuditLog {
            id: Uuid::new_v4(),
            license_id: data.license_id,
            action: data.action,
            details: data.details,
            ip_address: data.context.ip_address,
            user_agent: data.context.user_agent,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        license_id: Option<Uuid>,
        page: Page,
    ) -> StoreResult<Vec<AuditLog>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .audit_logs
            .iter()
            .rev()
            .filter(|log| license_id.map_or(true, |id| log.license_id == Some(id)))
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn license_data(key: &str, max_devices: i32) -> CreateLicenseData {
        CreateLicenseData {
            license_key: key.to_string(),
            tenant_name: "Lahore Mart".to_string(),
            plan: None,
            max_devices,
            max_users: 1,
            features: Default::default(),
            start_date: None,
            expiry_date: NaiveDate::from_ymd_opt(2099, 1, 1).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_license_key_rejected() {
        let store = MemoryStore::new();
        store
            .create_license(license_data("HK-AAAA-BBBB-CCCC", 1))
            .await
            .unwrap();

        let err = store
            .create_license(license_data("HK-AAAA-BBBB-CCCC", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateLicenseKey));
    }

    #[tokio::test]
    async fn test_activation_respects_ceiling_but_not_for_known_devices() {
        let store = MemoryStore::new();
        let license = store
            .create_license(license_data("HK-AAAA-BBBB-CCCC", 1))
            .await
            .unwrap();
        let now = Utc::now();

        let first = store.activate_device(license.id, "dev-a", now).await.unwrap();
        assert!(matches!(
            first,
            ActivationGrant::Granted {
                newly_created: true,
                ..
            }
        ));

        let second = store.activate_device(license.id, "dev-b", now).await.unwrap();
        assert!(matches!(
            second,
            ActivationGrant::LimitReached {
                active_devices: 1,
                max_devices: 1
            }
        ));

        let again = store.activate_device(license.id, "dev-a", now).await.unwrap();
        assert!(matches!(
            again,
            ActivationGrant::Granted {
                newly_created: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_replace_challenge_removes_previous_for_same_kind_only() {
        let store = MemoryStore::new();
        let admin_id = Uuid::new_v4();
        let expires_at = Utc::now() + Duration::minutes(10);
        let data = |token: &str, kind| CreateChallengeData {
            token: token.to_string(),
            admin_id,
            kind,
            code: "123456".to_string(),
            email: "ops@example.com".to_string(),
            payload: None,
            expires_at,
        };

        store
            .replace_challenge(data("t1", ChallengeKind::Login))
            .await
            .unwrap();
        store
            .replace_challenge(data("t2", ChallengeKind::PasswordChange))
            .await
            .unwrap();
        store
            .replace_challenge(data("t3", ChallengeKind::Login))
            .await
            .unwrap();

        assert!(store
            .find_unused_challenge("t1", ChallengeKind::Login)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_unused_challenge("t2", ChallengeKind::PasswordChange)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .find_unused_challenge("t3", ChallengeKind::Login)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_purge_keeps_recent_challenges() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = store
            .replace_challenge(CreateChallengeData {
                token: "old".to_string(),
                admin_id: Uuid::new_v4(),
                kind: ChallengeKind::Login,
                code: "000001".to_string(),
                email: "ops@example.com".to_string(),
                payload: None,
                expires_at: now - Duration::hours(30),
            })
            .await
            .unwrap();
        store
            .replace_challenge(CreateChallengeData {
                token: "fresh".to_string(),
                admin_id: Uuid::new_v4(),
                kind: ChallengeKind::Login,
                code: "000002".to_string(),
                email: "ops@example.com".to_string(),
                payload: None,
                expires_at: now + Duration::minutes(10),
            })
            .await
            .unwrap();

        let purged = store
            .purge_stale_challenges(now, Duration::hours(24))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(store
            .find_unused_challenge(&old.token, ChallengeKind::Login)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_unused_challenge("fresh", ChallengeKind::Login)
            .await
            .unwrap()
            .is_some());
    }
}
