//! Persistence seams consumed by the services.
//!
//! Every operation that must be atomic is a single trait method, so each
//! backend decides how to make it so (row locks in Postgres, one mutex
//! section in memory).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{
    activation::{Activation, ActivationStatus},
    admin_user::{AdminUser, CreateAdminData},
    audit_log::{AuditLog, CreateAuditLogData},
    challenge::{ChallengeKind, CreateChallengeData, VerificationChallenge},
    license::{CreateLicenseData, License, LicenseFilter, LicenseStats, UpdateLicenseData},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("License key already exists")]
    DuplicateLicenseKey,

    #[error("Username already exists")]
    DuplicateUsername,
}

impl StoreError {
    /// Connectivity problems the caller may retry, as opposed to bad queries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pagination parameters for list queries.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    /// Builds a page from 1-based page numbers as sent by the admin UI.
    pub fn new(page: i64, limit: i64) -> Self {
        let limit = limit.clamp(1, 500);
        let page = page.max(1);
        Self {
            limit,
            offset: (page - 1) * limit,
        }
    }
}

/// Which identifier the device quoted in a status check.
#[derive(Debug, Clone)]
pub enum LicenseRef {
    Id(Uuid),
    Key(String),
}

/// A license together with this device's activation, read in one statement.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub license: License,
    pub activation: Option<Activation>,
}

/// Result of the atomic count-then-upsert.
#[derive(Debug, Clone)]
pub enum ActivationGrant {
    Granted {
        activation: Activation,
        newly_created: bool,
    },
    /// A new device hit the ceiling; nothing was written.
    LimitReached {
        active_devices: i64,
        max_devices: i32,
    },
    /// The license stopped being active before the lock was taken.
    LicenseUnavailable { license: License },
    /// The license was deleted between lookup and lock.
    LicenseMissing,
}

#[derive(Debug, Clone)]
pub enum DeleteLicenseOutcome {
    Deleted,
    NotFound,
    HasActiveActivations { active_devices: i64 },
}

#[async_trait]
pub trait LicenseStore: Send + Sync {
    async fn create_license(&self, data: CreateLicenseData) -> StoreResult<License>;
    async fn find_license_by_id(&self, id: Uuid) -> StoreResult<Option<License>>;
    async fn find_license_by_key(&self, license_key: &str) -> StoreResult<Option<License>>;
    async fn update_license(&self, id: Uuid, data: UpdateLicenseData)
        -> StoreResult<Option<License>>;

    /// Moves an active license to `expired`; true only for the caller that
    /// made the transition.
    async fn expire_license(&self, id: Uuid) -> StoreResult<bool>;

    /// Expires every active license past its expiry date and returns their ids.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    /// Counts active activations and upserts this device's activation as
    /// one atomic unit per license.
    async fn activate_device(
        &self,
        license_id: Uuid,
        device_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<ActivationGrant>;

    async fn device_snapshot(
        &self,
        license: &LicenseRef,
        device_hash: &str,
    ) -> StoreResult<Option<DeviceSnapshot>>;

    /// Refreshes `last_check` while the activation is still active.
    async fn touch_activation(
        &self,
        activation_id: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Activation>>;

    /// Revokes the license and all its activations in one transaction.
    async fn revoke_license(&self, id: Uuid) -> StoreResult<Option<(License, u64)>>;

    async fn delete_license(&self, id: Uuid) -> StoreResult<DeleteLicenseOutcome>;

    async fn list_licenses(
        &self,
        filter: &LicenseFilter,
        page: Page,
    ) -> StoreResult<(Vec<License>, i64)>;

    async fn list_activations(&self, license_id: Uuid) -> StoreResult<Vec<Activation>>;

    async fn set_activation_status(
        &self,
        activation_id: Uuid,
        status: ActivationStatus,
    ) -> StoreResult<Option<Activation>>;

    async fn license_stats(&self) -> StoreResult<LicenseStats>;

    async fn ping(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn create_admin(&self, data: CreateAdminData) -> StoreResult<AdminUser>;
    async fn find_admin_by_username(&self, username: &str) -> StoreResult<Option<AdminUser>>;
    async fn find_admin_by_id(&self, id: Uuid) -> StoreResult<Option<AdminUser>>;
    async fn update_admin_password(&self, id: Uuid, password_hash: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Deletes every challenge of the same admin and kind, then inserts the
    /// new one, atomically.
    async fn replace_challenge(&self, data: CreateChallengeData)
        -> StoreResult<VerificationChallenge>;

    async fn find_unused_challenge(
        &self,
        token: &str,
        kind: ChallengeKind,
    ) -> StoreResult<Option<VerificationChallenge>>;

    /// Sets `used_at`; true only for the first caller.
    async fn consume_challenge(&self, id: Uuid, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn delete_challenge(&self, id: Uuid) -> StoreResult<()>;

    async fn delete_challenges_for(&self, admin_id: Uuid, kind: ChallengeKind)
        -> StoreResult<u64>;

    async fn purge_stale_challenges(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> StoreResult<u64>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, data: CreateAuditLogData) -> StoreResult<()>;

    async fn list_audit_logs(
        &self,
        license_id: Option<Uuid>,
        page: Page,
    ) -> StoreResult<Vec<AuditLog>>;
}

/// Everything the HTTP layer needs from one backend.
pub trait Store: LicenseStore + AdminStore + ChallengeStore + AuditSink {}

impl<T> Store for T where T: LicenseStore + AdminStore + ChallengeStore + AuditSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offsets_are_one_based() {
        let page = Page::new(3, 50);
        assert_eq!(page.limit, 50);
        assert_eq!(page.offset, 100);
    }

    #[test]
    fn test_page_clamps_bad_input() {
        let page = Page::new(0, 0);
        assert_eq!(page.limit, 1);
        assert_eq!(page.offset, 0);

        assert_eq!(Page::new(1, 10_000).limit, 500);
    }
}
