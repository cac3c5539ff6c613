use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::models::{
    activation::{Activation, ActivationStatus},
    audit_log::{AuditLog, RequestContext},
    license::{
        CreateLicenseData, Features, License, LicenseFilter, LicenseStats, LicenseStatus,
        UpdateLicenseData,
    },
};
use crate::services::{
    audit::AuditRecorder,
    license_key::{generate_license_key, validate_license_key_format, KeyGenerationError},
};
use crate::store::{AuditSink, DeleteLicenseOutcome, LicenseStore, Page, StoreError};

#[derive(thiserror::Error, Debug)]
pub enum LicenseAdminError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("License key already exists")]
    DuplicateKey,

    #[error("License still has {active_devices} active device(s)")]
    HasActiveActivations { active_devices: i64 },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    KeyGeneration(#[from] KeyGenerationError),
}

impl From<StoreError> for LicenseAdminError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateLicenseKey => LicenseAdminError::DuplicateKey,
            other => LicenseAdminError::Store(other),
        }
    }
}

/// Issuance request as submitted by the admin UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLicense {
    pub tenant_name: String,
    pub plan: Option<String>,
    pub max_devices: Option<i32>,
    pub max_users: Option<i32>,
    pub features: Option<Features>,
    pub start_date: Option<NaiveDate>,
    pub expiry_date: NaiveDate,
    pub license_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePage {
    pub licenses: Vec<License>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseDetail {
    #[serde(flatten)]
    pub license: License,
    pub activations: Vec<Activation>,
}

/// Back-office operations on licenses and their activations.
#[derive(Clone)]
pub struct LicenseAdmin {
    licenses: Arc<dyn LicenseStore>,
    audit_logs: Arc<dyn AuditSink>,
    audit: AuditRecorder,
}

impl LicenseAdmin {
    pub fn new(
        licenses: Arc<dyn LicenseStore>,
        audit_logs: Arc<dyn AuditSink>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            licenses,
            audit_logs,
            audit,
        }
    }

    #[tracing::instrument(skip(self, input, context), fields(tenant = %input.tenant_name))]
    pub async fn create_license(
        &self,
        input: NewLicense,
        context: &RequestContext,
    ) -> Result<License, LicenseAdminError> {
        let tenant_name = input.tenant_name.trim().to_string();
        if tenant_name.is_empty() {
            return Err(LicenseAdminError::Validation(
                "Tenant name is required".to_string(),
            ));
        }

        let max_devices = input.max_devices.unwrap_or(1);
        let max_users = input.max_users.unwrap_or(1);
        check_ceiling("maxDevices", max_devices)?;
        check_ceiling("maxUsers", max_users)?;

        let license_key = match input.license_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => generate_license_key()?,
        };
        if !validate_license_key_format(&license_key) {
            return Err(LicenseAdminError::Validation(
                "Invalid license key format. Must be HK-XXXX-XXXX-XXXX".to_string(),
            ));
        }

        let license = self
            .licenses
            .create_license(CreateLicenseData {
                license_key,
                tenant_name,
                plan: input.plan.filter(|p| !p.trim().is_empty()),
                max_devices,
                max_users,
                features: input.features.unwrap_or_default(),
                start_date: input.start_date,
                expiry_date: input.expiry_date,
            })
            .await?;

        tracing::info!(license_id = %license.id, "License created");
        self.audit
            .record(
                "license_created",
                json!({
                    "licenseKey": license.license_key,
                    "tenantName": license.tenant_name,
                }),
                Some(license.id),
                context,
            )
            .await;

        Ok(license)
    }

    #[tracing::instrument(skip(self, patch, context))]
    pub async fn update_license(
        &self,
        id: Uuid,
        patch: UpdateLicenseData,
        context: &RequestContext,
    ) -> Result<License, LicenseAdminError> {
        if patch.is_empty() {
            return Err(LicenseAdminError::Validation(
                "No fields to update".to_string(),
            ));
        }
        // Revocation must reach the activations too; only `revoke_license` does that.
        if patch.status == Some(LicenseStatus::Revoked) {
            return Err(LicenseAdminError::Validation(
                "Use POST /api/admin/licenses/:id/revoke to revoke a license".to_string(),
            ));
        }
        if let Some(max_devices) = patch.max_devices {
            check_ceiling("maxDevices", max_devices)?;
        }
        if let Some(max_users) = patch.max_users {
            check_ceiling("maxUsers", max_users)?;
        }
        if patch
            .tenant_name
            .as_deref()
            .is_some_and(|t| t.trim().is_empty())
        {
            return Err(LicenseAdminError::Validation(
                "Tenant name cannot be empty".to_string(),
            ));
        }

        let changes = serde_json::to_value(&patch).unwrap_or_default();
        let license = self
            .licenses
            .update_license(id, patch)
            .await?
            .ok_or(LicenseAdminError::NotFound("License"))?;

        self.audit
            .record(
                "license_updated",
                json!({ "changes": changes }),
                Some(license.id),
                context,
            )
            .await;

        Ok(license)
    }

    /// Revokes the license and every activation it has, in one transaction.
    #[tracing::instrument(skip(self, context))]
    pub async fn revoke_license(
        &self,
        id: Uuid,
        context: &RequestContext,
    ) -> Result<License, LicenseAdminError> {
        let (license, revoked_activations) = self
            .licenses
            .revoke_license(id)
            .await?
            .ok_or(LicenseAdminError::NotFound("License"))?;

        tracing::info!(license_id = %id, revoked_activations, "License revoked");
        self.audit
            .record(
                "license_revoked",
                json!({ "revokedActivations": revoked_activations }),
                Some(id),
                context,
            )
            .await;

        Ok(license)
    }

    #[tracing::instrument(skip(self, context))]
    pub async fn delete_license(
        &self,
        id: Uuid,
        context: &RequestContext,
    ) -> Result<(), LicenseAdminError> {
        match self.licenses.delete_license(id).await? {
            DeleteLicenseOutcome::Deleted => {
                self.audit
                    .record("license_deleted", json!({}), Some(id), context)
                    .await;
                Ok(())
            }
            DeleteLicenseOutcome::NotFound => Err(LicenseAdminError::NotFound("License")),
            DeleteLicenseOutcome::HasActiveActivations { active_devices } => {
                Err(LicenseAdminError::HasActiveActivations { active_devices })
            }
        }
    }

    pub async fn list_licenses(
        &self,
        filter: &LicenseFilter,
        page: i64,
        limit: i64,
        context: &RequestContext,
    ) -> Result<LicensePage, LicenseAdminError> {
        self.reconcile_overdue(context).await?;

        let window = Page::new(page, limit);
        let (licenses, total) = self.licenses.list_licenses(filter, window).await?;

        Ok(LicensePage {
            licenses,
            total,
            page: page.max(1),
            limit: window.limit,
        })
    }

    pub async fn license_detail(
        &self,
        id: Uuid,
        context: &RequestContext,
    ) -> Result<LicenseDetail, LicenseAdminError> {
        self.reconcile_overdue(context).await?;

        let license = self
            .licenses
            .find_license_by_id(id)
            .await?
            .ok_or(LicenseAdminError::NotFound("License"))?;
        let activations = self.licenses.list_activations(id).await?;

        Ok(LicenseDetail {
            license,
            activations,
        })
    }

    pub async fn dashboard_stats(
        &self,
        context: &RequestContext,
    ) -> Result<LicenseStats, LicenseAdminError> {
        self.reconcile_overdue(context).await?;
        Ok(self.licenses.license_stats().await?)
    }

    pub async fn audit_logs(
        &self,
        license_id: Option<Uuid>,
        page: i64,
        limit: i64,
    ) -> Result<Vec<AuditLog>, LicenseAdminError> {
        Ok(self
            .audit_logs
            .list_audit_logs(license_id, Page::new(page, limit))
            .await?)
    }

    /// Blocks or re-enables a single device.
    #[tracing::instrument(skip(self, context))]
    pub async fn set_activation_status(
        &self,
        activation_id: Uuid,
        status: ActivationStatus,
        context: &RequestContext,
    ) -> Result<Activation, LicenseAdminError> {
        let activation = self
            .licenses
            .set_activation_status(activation_id, status)
            .await?
            .ok_or(LicenseAdminError::NotFound("Activation"))?;

        self.audit
            .record(
                "activation_status_changed",
                json!({ "activationId": activation.id, "status": status }),
                Some(activation.license_id),
                context,
            )
            .await;

        Ok(activation)
    }

    /// Applies lazy expiry to every overdue license so listings and counts
    /// agree with what validation would decide.
    async fn reconcile_overdue(&self, context: &RequestContext) -> Result<(), LicenseAdminError> {
        let expired = self.licenses.expire_overdue(Utc::now()).await?;

        for license_id in expired {
            tracing::info!(%license_id, "License expired");
            self.audit
                .record(
                    "license_expired",
                    json!({ "source": "admin_read" }),
                    Some(license_id),
                    context,
                )
                .await;
        }

        Ok(())
    }
}

fn check_ceiling(field: &str, value: i32) -> Result<(), LicenseAdminError> {
    if value < 1 {
        return Err(LicenseAdminError::Validation(format!(
            "{field} must be at least 1"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn admin(store: &Arc<MemoryStore>) -> LicenseAdmin {
        LicenseAdmin::new(store.clone(), store.clone(), AuditRecorder::new(store.clone()))
    }

    fn new_license(key: Option<&str>, expiry_date: NaiveDate) -> NewLicense {
        NewLicense {
            tenant_name: "  Quetta Pharmacy ".to_string(),
            plan: Some("premium".to_string()),
            max_devices: None,
            max_users: None,
            features: None,
            start_date: None,
            expiry_date,
            license_key: key.map(str::to_string),
        }
    }

    fn next_year() -> NaiveDate {
        (Utc::now() + Duration::days(365)).date_naive()
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_generates_key() {
        let store = Arc::new(MemoryStore::new());
        let license = admin(&store)
            .create_license(new_license(Some("   "), next_year()), &RequestContext::default())
            .await
            .unwrap();

        assert!(validate_license_key_format(&license.license_key));
        assert_eq!(license.tenant_name, "Quetta Pharmacy");
        assert_eq!(license.max_devices, 1);
        assert_eq!(license.max_users, 1);
        assert!(license.features.0.is_empty());
        assert_eq!(license.status, LicenseStatus::Active);
    }

    #[tokio::test]
    async fn test_create_rejects_bad_key_and_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let admin = admin(&store);
        let ctx = RequestContext::default();

        let bad = admin
            .create_license(new_license(Some("hk-1234"), next_year()), &ctx)
            .await;
        assert!(matches!(bad, Err(LicenseAdminError::Validation(_))));

        admin
            .create_license(new_license(Some("HK-AB12-CD34-EF56"), next_year()), &ctx)
            .await
            .unwrap();
        let dup = admin
            .create_license(new_license(Some("HK-AB12-CD34-EF56"), next_year()), &ctx)
            .await;
        assert!(matches!(dup, Err(LicenseAdminError::DuplicateKey)));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let mut input = new_license(None, next_year());
        input.max_devices = Some(0);

        let result = admin(&store)
            .create_license(input, &RequestContext::default())
            .await;
        assert!(matches!(result, Err(LicenseAdminError::Validation(_))));
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let store = Arc::new(MemoryStore::new());
        let result = admin(&store)
            .update_license(
                Uuid::new_v4(),
                UpdateLicenseData::default(),
                &RequestContext::default(),
            )
            .await;
        assert!(matches!(result, Err(LicenseAdminError::Validation(_))));
    }

    #[tokio::test]
    async fn test_update_unknown_license_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let result = admin(&store)
            .update_license(
                Uuid::new_v4(),
                UpdateLicenseData {
                    max_devices: Some(3),
                    ..Default::default()
                },
                &RequestContext::default(),
            )
            .await;
        assert!(matches!(result, Err(LicenseAdminError::NotFound("License"))));
    }

    #[tokio::test]
    async fn test_listing_reconciles_expiry_first() {
        let store = Arc::new(MemoryStore::new());
        let admin = admin(&store);
        let ctx = RequestContext::default();
        let yesterday = (Utc::now() - Duration::days(1)).date_naive();

        let overdue = admin
            .create_license(new_license(None, yesterday), &ctx)
            .await
            .unwrap();
        admin
            .create_license(new_license(None, next_year()), &ctx)
            .await
            .unwrap();

        let stats = admin.dashboard_stats(&ctx).await.unwrap();
        assert_eq!(stats.active_licenses, 1);
        assert_eq!(stats.expired_licenses, 1);
        assert_eq!(stats.total_licenses, 2);

        let page = admin
            .list_licenses(
                &LicenseFilter {
                    status: Some(LicenseStatus::Expired),
                    ..Default::default()
                },
                1,
                50,
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.licenses[0].id, overdue.id);
    }

    #[tokio::test]
    async fn test_delete_refused_while_devices_active() {
        let store = Arc::new(MemoryStore::new());
        let admin = admin(&store);
        let ctx = RequestContext::default();
        let license = admin
            .create_license(new_license(None, next_year()), &ctx)
            .await
            .unwrap();
        store
            .activate_device(license.id, "hash-1", Utc::now())
            .await
            .unwrap();

        let refused = admin.delete_license(license.id, &ctx).await;
        assert!(matches!(
            refused,
            Err(LicenseAdminError::HasActiveActivations { active_devices: 1 })
        ));

        admin.revoke_license(license.id, &ctx).await.unwrap();
        admin.delete_license(license.id, &ctx).await.unwrap();
        assert!(store.find_license_by_id(license.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_detail_lists_activations() {
        let store = Arc::new(MemoryStore::new());
        let admin = admin(&store);
        let ctx = RequestContext::default();
        let mut input = new_license(None, next_year());
        input.max_devices = Some(2);
        let license = admin.create_license(input, &ctx).await.unwrap();

        store
            .activate_device(license.id, "hash-1", Utc::now())
            .await
            .unwrap();
        store
            .activate_device(license.id, "hash-2", Utc::now())
            .await
            .unwrap();

        let detail = admin.license_detail(license.id, &ctx).await.unwrap();
        assert_eq!(detail.activations.len(), 2);

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["licenseKey"], license.license_key);
        assert_eq!(json["activations"].as_array().unwrap().len(), 2);
    }
}
