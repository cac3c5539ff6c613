use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::error::{AppError, Result};
use crate::models::{
    activation::ActivationStatus,
    audit_log::RequestContext,
    license::{Features, LicenseStatus},
};
use crate::services::license_validator::{Rejection, StatusOutcome, ValidationOutcome};
use crate::store::LicenseRef;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(default)]
    pub license_key: String,
    #[serde(default)]
    pub device_id: String,
    pub app_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub license_id: Option<Uuid>,
    pub license_key: Option<String>,
    pub device_id: Option<String>,
}

/// Body of a `valid: false` answer. `code` is the stable machine reason,
/// `reason` the text shown to the operator.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub valid: bool,
    pub code: &'static str,
    pub reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_devices: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_devices: Option<i64>,
}

impl From<Rejection> for RejectionBody {
    fn from(rejection: Rejection) -> Self {
        let status = rejection
            .activation_status
            .as_ref()
            .map(ActivationStatus::as_str)
            .or(rejection.license_status.as_ref().map(LicenseStatus::as_str));

        Self {
            valid: false,
            code: rejection.reason.as_str(),
            reason: rejection.reason.message(),
            status,
            expiry_date: rejection.expiry_date,
            max_devices: rejection.max_devices,
            current_devices: rejection.active_devices,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidResponse {
    pub valid: bool,
    pub license_id: Uuid,
    pub tenant_name: String,
    pub features: Features,
    pub expiry_date: NaiveDate,
    pub max_users: i32,
    pub max_devices: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStatusResponse {
    pub valid: bool,
    pub status: &'static str,
    pub features: Features,
    pub expiry_date: NaiveDate,
    pub max_users: i32,
    pub max_devices: i32,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LicenseAnswer {
    Valid(ValidResponse),
    Active(ActiveStatusResponse),
    Invalid(RejectionBody),
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/license/validate", post(validate_license))
        .route("/api/license/status", get(license_status))
}

/// Activation or re-check from a POS device. Business rejections are
/// `200` with `valid: false`.
async fn validate_license(
    State(state): State<AppState>,
    context: RequestContext,
    Json(body): Json<ValidateRequest>,
) -> Result<Json<LicenseAnswer>> {
    let license_key = body.license_key.trim();
    let device_id = body.device_id.trim();
    if license_key.is_empty() || device_id.is_empty() {
        return Err(AppError::Validation(
            "licenseKey and deviceId are required".to_string(),
        ));
    }

    let outcome = state
        .validator
        .validate(license_key, device_id, body.app_version.as_deref(), &context)
        .await?;

    let answer = match outcome {
        ValidationOutcome::Valid(entitlement) => LicenseAnswer::Valid(ValidResponse {
            valid: true,
            license_id: entitlement.license_id,
            tenant_name: entitlement.tenant_name,
            features: entitlement.features,
            expiry_date: entitlement.expiry_date,
            max_users: entitlement.max_users,
            max_devices: entitlement.max_devices,
        }),
        ValidationOutcome::Invalid(rejection) => LicenseAnswer::Invalid(rejection.into()),
    };

    Ok(Json(answer))
}

/// Periodic check; never creates an activation.
async fn license_status(
    State(state): State<AppState>,
    context: RequestContext,
    Query(query): Query<StatusQuery>,
) -> Result<Json<LicenseAnswer>> {
    let device_id = query
        .device_id
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());

    let license = match (query.license_id, query.license_key.as_deref().map(str::trim)) {
        (Some(id), _) => Some(LicenseRef::Id(id)),
        (None, Some(key)) if !key.is_empty() => Some(LicenseRef::Key(key.to_string())),
        _ => None,
    };

    let (Some(license), Some(device_id)) = (license, device_id) else {
        return Err(AppError::Validation(
            "licenseId and deviceId are required".to_string(),
        ));
    };

    let outcome = state
        .validator
        .check_status(&license, device_id, &context)
        .await?;

    let answer = match outcome {
        StatusOutcome::Active {
            entitlement,
            last_check,
        } => LicenseAnswer::Active(ActiveStatusResponse {
            valid: true,
            status: LicenseStatus::Active.as_str(),
            features: entitlement.features,
            expiry_date: entitlement.expiry_date,
            max_users: entitlement.max_users,
            max_devices: entitlement.max_devices,
            last_check,
        }),
        StatusOutcome::Invalid(rejection) => LicenseAnswer::Invalid(rejection.into()),
    };

    Ok(Json(answer))
}
