use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;

use crate::models::{
    activation::{Activation, ActivationStatus},
    audit_log::RequestContext,
    license::{License, LicenseEntitlement, LicenseStatus},
};
use crate::services::{audit::AuditRecorder, device_hash::hash_device_id};
use crate::store::{ActivationGrant, DeviceSnapshot, LicenseRef, LicenseStore, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("License store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Why a device was turned away. Serialized as the stable machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    LicenseNotFound,
    LicenseExpired,
    LicenseRevoked,
    LicenseSuspended,
    DeviceLimitExceeded,
    DeviceNotActivated,
    DeviceBlocked,
    DeviceRevoked,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::LicenseNotFound => "license_not_found",
            InvalidReason::LicenseExpired => "license_expired",
            InvalidReason::LicenseRevoked => "license_revoked",
            InvalidReason::LicenseSuspended => "license_suspended",
            InvalidReason::DeviceLimitExceeded => "device_limit_exceeded",
            InvalidReason::DeviceNotActivated => "device_not_activated",
            InvalidReason::DeviceBlocked => "device_blocked",
            InvalidReason::DeviceRevoked => "device_revoked",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::LicenseNotFound => "License key not found",
            InvalidReason::LicenseExpired => "License has expired",
            InvalidReason::LicenseRevoked => "License is revoked",
            InvalidReason::LicenseSuspended => "License is suspended",
            InvalidReason::DeviceLimitExceeded => "Maximum device limit reached",
            InvalidReason::DeviceNotActivated => "Device not activated for this license",
            InvalidReason::DeviceBlocked => "Device activation is blocked",
            InvalidReason::DeviceRevoked => "Device activation is revoked",
        }
    }

    /// `license_<status>` for a license that is not active.
    fn for_license(status: LicenseStatus) -> Option<Self> {
        match status {
            LicenseStatus::Active => None,
            LicenseStatus::Expired => Some(InvalidReason::LicenseExpired),
            LicenseStatus::Revoked => Some(InvalidReason::LicenseRevoked),
            LicenseStatus::Suspended => Some(InvalidReason::LicenseSuspended),
        }
    }

    /// `device_<status>` for an activation that is not active.
    fn for_activation(status: ActivationStatus) -> Option<Self> {
        match status {
            ActivationStatus::Active => None,
            ActivationStatus::Blocked => Some(InvalidReason::DeviceBlocked),
            ActivationStatus::Revoked => Some(InvalidReason::DeviceRevoked),
        }
    }
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business rejection plus whatever context the client may show.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: InvalidReason,
    pub license_status: Option<LicenseStatus>,
    pub activation_status: Option<ActivationStatus>,
    pub expiry_date: Option<NaiveDate>,
    pub active_devices: Option<i64>,
    pub max_devices: Option<i32>,
}

impl Rejection {
    fn new(reason: InvalidReason) -> Self {
        Self {
            reason,
            license_status: None,
            activation_status: None,
            expiry_date: None,
            active_devices: None,
            max_devices: None,
        }
    }

    fn for_inactive_license(license: &License) -> Option<Self> {
        InvalidReason::for_license(license.status).map(|reason| {
            let mut rejection = Rejection::new(reason);
            rejection.license_status = Some(license.status);
            if license.status == LicenseStatus::Expired {
                rejection.expiry_date = Some(license.expiry_date);
            }
            rejection
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid(LicenseEntitlement),
    Invalid(Rejection),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    Active {
        entitlement: LicenseEntitlement,
        last_check: DateTime<Utc>,
    },
    Invalid(Rejection),
}

/// Decides whether a (license, device) pair may operate and keeps the
/// activation records in step with those decisions.
#[derive(Clone)]
pub struct LicenseValidator {
    store: Arc<dyn LicenseStore>,
    audit: AuditRecorder,
}

impl LicenseValidator {
    pub fn new(store: Arc<dyn LicenseStore>, audit: AuditRecorder) -> Self {
        Self { store, audit }
    }

    pub async fn validate(
        &self,
        license_key: &str,
        device_id: &str,
        app_version: Option<&str>,
        context: &RequestContext,
    ) -> Result<ValidationOutcome, ValidationError> {
        self.validate_at(license_key, device_id, app_version, context, Utc::now())
            .await
    }

    #[tracing::instrument(
        skip(self, device_id, context),
        fields(device_hash = tracing::field::Empty)
    )]
    pub async fn validate_at(
        &self,
        license_key: &str,
        device_id: &str,
        app_version: Option<&str>,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<ValidationOutcome, ValidationError> {
        let device_hash = hash_device_id(device_id);
        tracing::Span::current().record("device_hash", device_hash.as_str());

        let Some(license) = self.store.find_license_by_key(license_key).await? else {
            let rejection = Rejection::new(InvalidReason::LicenseNotFound);
            return Ok(self
                .reject_validation(license_key, &device_hash, None, rejection, context)
                .await);
        };

        let license = self.reconcile_expiry(license, now, context).await?;
        if let Some(rejection) = Rejection::for_inactive_license(&license) {
            return Ok(self
                .reject_validation(license_key, &device_hash, Some(&license), rejection, context)
                .await);
        }

        let grant = self
            .store
            .activate_device(license.id, &device_hash, now)
            .await?;

        match grant {
            ActivationGrant::Granted {
                activation,
                newly_created,
            } => {
                tracing::info!(
                    license_id = %license.id,
                    activation_id = %activation.id,
                    newly_created,
                    "License validated"
                );
                self.audit
                    .record(
                        "validation_success",
                        json!({
                            "licenseKey": license_key,
                            "deviceId": device_hash,
                            "appVersion": app_version,
                            "newActivation": newly_created,
                        }),
                        Some(license.id),
                        context,
                    )
                    .await;

                Ok(ValidationOutcome::Valid(license.entitlement()))
            }
            ActivationGrant::LimitReached {
                active_devices,
                max_devices,
            } => {
                let mut rejection = Rejection::new(InvalidReason::DeviceLimitExceeded);
                rejection.active_devices = Some(active_devices);
                rejection.max_devices = Some(max_devices);
                Ok(self
                    .reject_validation(license_key, &device_hash, Some(&license), rejection, context)
                    .await)
            }
            ActivationGrant::LicenseUnavailable { license } => {
                // Status changed between the read and the row lock.
                let rejection = Rejection::for_inactive_license(&license)
                    .unwrap_or_else(|| Rejection::new(InvalidReason::LicenseNotFound));
                Ok(self
                    .reject_validation(license_key, &device_hash, Some(&license), rejection, context)
                    .await)
            }
            ActivationGrant::LicenseMissing => {
                let rejection = Rejection::new(InvalidReason::LicenseNotFound);
                Ok(self
                    .reject_validation(license_key, &device_hash, None, rejection, context)
                    .await)
            }
        }
    }

    pub async fn check_status(
        &self,
        license: &LicenseRef,
        device_id: &str,
        context: &RequestContext,
    ) -> Result<StatusOutcome, ValidationError> {
        self.check_status_at(license, device_id, context, Utc::now())
            .await
    }

    /// Read-only counterpart of `validate`: never creates an activation,
    /// only refreshes `last_check` of an existing active one.
    #[tracing::instrument(
        skip(self, device_id, context),
        fields(device_hash = tracing::field::Empty)
    )]
    pub async fn check_status_at(
        &self,
        license: &LicenseRef,
        device_id: &str,
        context: &RequestContext,
        now: DateTime<Utc>,
    ) -> Result<StatusOutcome, ValidationError> {
        let device_hash = hash_device_id(device_id);
        tracing::Span::current().record("device_hash", device_hash.as_str());

        let Some(snapshot) = self.store.device_snapshot(license, &device_hash).await? else {
            let rejection = Rejection::new(InvalidReason::LicenseNotFound);
            return Ok(StatusOutcome::Invalid(
                self.reject_status(&device_hash, None, rejection, context)
                    .await,
            ));
        };

        let DeviceSnapshot {
            license,
            activation,
        } = snapshot;
        let license = self.reconcile_expiry(license, now, context).await?;

        let activation = match judge(&license, activation.as_ref()) {
            Ok(activation) => activation.clone(),
            Err(rejection) => {
                return Ok(StatusOutcome::Invalid(
                    self.reject_status(&device_hash, Some(&license), rejection, context)
                        .await,
                ))
            }
        };

        if let Some(touched) = self.store.touch_activation(activation.id, now).await? {
            return Ok(StatusOutcome::Active {
                entitlement: license.entitlement(),
                last_check: touched.last_check,
            });
        }

        // The activation left `active` after the snapshot, most likely a
        // concurrent revoke. Report the state as it is now.
        let refreshed = self
            .store
            .device_snapshot(&LicenseRef::Id(license.id), &device_hash)
            .await?;
        let rejection = match refreshed {
            None => Rejection::new(InvalidReason::LicenseNotFound),
            Some(DeviceSnapshot {
                license,
                activation,
            }) => match judge(&license, activation.as_ref()) {
                Ok(activation) => {
                    return Ok(StatusOutcome::Active {
                        entitlement: license.entitlement(),
                        last_check: activation.last_check,
                    })
                }
                Err(rejection) => rejection,
            },
        };

        Ok(StatusOutcome::Invalid(
            self.reject_status(&device_hash, Some(&license), rejection, context)
                .await,
        ))
    }

    /// Applies lazy expiry: an active license past its expiry date is moved
    /// to `expired` before anything else looks at its status.
    pub async fn reconcile_expiry(
        &self,
        mut license: License,
        now: DateTime<Utc>,
        context: &RequestContext,
    ) -> Result<License, ValidationError> {
        if !license.is_active() || !license.is_expired_at(now) {
            return Ok(license);
        }

        if self.store.expire_license(license.id).await? {
            tracing::info!(
                license_id = %license.id,
                expiry_date = %license.expiry_date,
                "License expired"
            );
            self.audit
                .record(
                    "license_expired",
                    json!({
                        "licenseKey": license.license_key,
                        "expiryDate": license.expiry_date,
                    }),
                    Some(license.id),
                    context,
                )
                .await;
        }

        license.status = LicenseStatus::Expired;
        Ok(license)
    }

    async fn reject_validation(
        &self,
        license_key: &str,
        device_hash: &str,
        license: Option<&License>,
        rejection: Rejection,
        context: &RequestContext,
    ) -> ValidationOutcome {
        tracing::info!(reason = %rejection.reason, "License validation rejected");
        self.audit
            .record(
                "validation_failed",
                json!({
                    "licenseKey": license_key,
                    "reason": rejection.reason,
                    "deviceId": device_hash,
                }),
                license.map(|l| l.id),
                context,
            )
            .await;

        ValidationOutcome::Invalid(rejection)
    }

    async fn reject_status(
        &self,
        device_hash: &str,
        license: Option<&License>,
        rejection: Rejection,
        context: &RequestContext,
    ) -> Rejection {
        tracing::info!(reason = %rejection.reason, "Status check rejected");
        self.audit
            .record(
                "status_check_failed",
                json!({
                    "reason": rejection.reason,
                    "deviceId": device_hash,
                }),
                license.map(|l| l.id),
                context,
            )
            .await;

        rejection
    }
}

/// License state first, then the device's own activation.
fn judge<'a>(
    license: &License,
    activation: Option<&'a Activation>,
) -> Result<&'a Activation, Rejection> {
    if let Some(rejection) = Rejection::for_inactive_license(license) {
        return Err(rejection);
    }

    let activation =
        activation.ok_or_else(|| Rejection::new(InvalidReason::DeviceNotActivated))?;

    match InvalidReason::for_activation(activation.status) {
        Some(reason) => {
            let mut rejection = Rejection::new(reason);
            rejection.activation_status = Some(activation.status);
            Err(rejection)
        }
        None => Ok(activation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::license::CreateLicenseData;
    use crate::store::{AuditSink, MemoryStore};
    use chrono::{Duration, NaiveDate};

    fn validator(store: &Arc<MemoryStore>) -> LicenseValidator {
        LicenseValidator::new(store.clone(), AuditRecorder::new(store.clone()))
    }

    async fn seed(store: &MemoryStore, expiry_date: NaiveDate, max_devices: i32) -> License {
        store
            .create_license(CreateLicenseData {
                license_key: "HK-AB12-CD34-EF56".to_string(),
                tenant_name: "Karachi Traders".to_string(),
                plan: Some("standard".to_string()),
                max_devices,
                max_users: 3,
                features: [("inventory".to_string(), true)].into_iter().collect(),
                start_date: None,
                expiry_date,
            })
            .await
            .unwrap()
    }

    fn tomorrow() -> NaiveDate {
        (Utc::now() + Duration::days(1)).date_naive()
    }

    fn reason(outcome: ValidationOutcome) -> InvalidReason {
        match outcome {
            ValidationOutcome::Invalid(rejection) => rejection.reason,
            ValidationOutcome::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(InvalidReason::LicenseRevoked.as_str(), "license_revoked");
        assert_eq!(
            serde_json::to_value(InvalidReason::DeviceLimitExceeded).unwrap(),
            "device_limit_exceeded"
        );
        assert_eq!(
            InvalidReason::for_license(LicenseStatus::Suspended),
            Some(InvalidReason::LicenseSuspended)
        );
        assert_eq!(InvalidReason::for_license(LicenseStatus::Active), None);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let outcome = validator(&store)
            .validate("HK-ZZZZ-ZZZZ-ZZZZ", "pos-1", None, &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(reason(outcome), InvalidReason::LicenseNotFound);
    }

    #[tokio::test]
    async fn test_valid_outcome_carries_entitlement_only() {
        let store = Arc::new(MemoryStore::new());
        let license = seed(&store, tomorrow(), 2).await;

        let outcome = validator(&store)
            .validate(&license.license_key, "pos-1", Some("2.4.0"), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(outcome, ValidationOutcome::Valid(license.entitlement()));
    }

    #[tokio::test]
    async fn test_suspended_license_rejected_before_expiry() {
        let store = Arc::new(MemoryStore::new());
        let license = seed(&store, tomorrow(), 2).await;
        store
            .update_license(
                license.id,
                crate::models::license::UpdateLicenseData {
                    status: Some(LicenseStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = validator(&store)
            .validate(&license.license_key, "pos-1", None, &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(reason(outcome), InvalidReason::LicenseSuspended);
        assert!(store.list_activations(license.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_device_fails_status_check() {
        let store = Arc::new(MemoryStore::new());
        let license = seed(&store, tomorrow(), 2).await;
        let validator = validator(&store);
        let ctx = RequestContext::default();

        validator
            .validate(&license.license_key, "pos-1", None, &ctx)
            .await
            .unwrap();
        let activation = store.list_activations(license.id).await.unwrap().remove(0);
        store
            .set_activation_status(activation.id, ActivationStatus::Blocked)
            .await
            .unwrap();

        let outcome = validator
            .check_status(&LicenseRef::Id(license.id), "pos-1", &ctx)
            .await
            .unwrap();

        match outcome {
            StatusOutcome::Invalid(rejection) => {
                assert_eq!(rejection.reason, InvalidReason::DeviceBlocked);
                assert_eq!(rejection.activation_status, Some(ActivationStatus::Blocked));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_status_check_never_activates() {
        let store = Arc::new(MemoryStore::new());
        let license = seed(&store, tomorrow(), 2).await;

        let outcome = validator(&store)
            .check_status(
                &LicenseRef::Key(license.license_key.clone()),
                "pos-9",
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            StatusOutcome::Invalid(Rejection {
                reason: InvalidReason::DeviceNotActivated,
                ..
            })
        ));
        assert!(store.list_activations(license.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_check_refreshes_last_check() {
        let store = Arc::new(MemoryStore::new());
        let license = seed(&store, tomorrow(), 1).await;
        let validator = validator(&store);
        let ctx = RequestContext::default();
        let first = Utc::now();

        validator
            .validate_at(&license.license_key, "pos-1", None, &ctx, first)
            .await
            .unwrap();

        let later = first + Duration::minutes(5);
        let outcome = validator
            .check_status_at(&LicenseRef::Id(license.id), "pos-1", &ctx, later)
            .await
            .unwrap();

        match outcome {
            StatusOutcome::Active { last_check, .. } => assert_eq!(last_check, later),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_validation_is_audited_with_hashed_device() {
        let store = Arc::new(MemoryStore::new());
        validator(&store)
            .validate("HK-ZZZZ-ZZZZ-ZZZZ", "raw-device", None, &RequestContext::default())
            .await
            .unwrap();

        let logs = store
            .list_audit_logs(None, crate::store::Page::new(1, 10))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "validation_failed");
        assert_eq!(logs[0].details["reason"], "license_not_found");
        assert_eq!(logs[0].details["deviceId"], hash_device_id("raw-device"));
    }
}
