use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::api::{
    middleware::auth::{require_admin, AuthenticatedAdmin},
    state::AppState,
};
use crate::error::{AppError, Result};
use crate::models::{
    activation::{Activation, ActivationStatus},
    admin_user::AdminUser,
    audit_log::{AuditLog, RequestContext},
    license::{License, LicenseFilter, LicenseStats, LicenseStatus, UpdateLicenseData},
};
use crate::services::{
    authenticator::{AdminSession, ChallengeHandle, LoginStep},
    license_admin::{LicenseDetail, LicensePage, NewLicense},
};

const DEFAULT_PAGE_SIZE: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeRequest {
    #[serde(default)]
    pub temp_token: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeRequest {
    #[serde(default)]
    pub current_password: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseListQuery {
    pub status: Option<LicenseStatus>,
    pub search: Option<String>,
    pub plan: Option<String>,
    pub license_key: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogQuery {
    pub license_id: Option<Uuid>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ActivationStatusRequest {
    pub status: ActivationStatus,
}

#[derive(Debug, Serialize)]
pub struct AdminProfile {
    pub id: Uuid,
    pub username: String,
    pub role: String,
}

impl From<AdminUser> for AdminProfile {
    fn from(admin: AdminUser) -> Self {
        Self {
            id: admin.id,
            username: admin.username,
            role: admin.role,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: AdminProfile,
}

impl From<AdminSession> for SessionResponse {
    fn from(session: AdminSession) -> Self {
        Self {
            token: session.token,
            user: session.admin.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSentResponse {
    #[serde(rename = "require2FA")]
    pub require_2fa: bool,
    pub temp_token: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub message: String,
}

impl From<ChallengeHandle> for CodeSentResponse {
    fn from(handle: ChallengeHandle) -> Self {
        Self {
            require_2fa: true,
            message: format!(
                "Verification code sent to {}. Check your inbox.",
                handle.email
            ),
            temp_token: handle.token,
            email: handle.email,
            expires_at: handle.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    CodeSent(CodeSentResponse),
    Authenticated(SessionResponse),
}

pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/api/admin/change-password/request", post(request_password_change))
        .route("/api/admin/change-password/verify", post(verify_password_change))
        .route("/api/admin/licenses", get(list_licenses).post(create_license))
        .route(
            "/api/admin/licenses/:id",
            get(get_license).put(update_license).delete(delete_license),
        )
        .route("/api/admin/licenses/:id/revoke", post(revoke_license))
        .route("/api/admin/activations/:id/status", put(set_activation_status))
        .route("/api/admin/dashboard/stats", get(dashboard_stats))
        .route("/api/admin/audit-logs", get(audit_logs))
        .route_layer(middleware::from_fn_with_state(state, require_admin));

    Router::new()
        .route("/api/admin/login", post(login))
        .route("/api/admin/verify-2fa", post(verify_login_code))
        .merge(protected)
}

fn required(value: &str, message: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(message.to_string()));
    }
    Ok(())
}

/// Accepts the code with surrounding whitespace, as typed from an email.
fn normalize_code(request: &CodeRequest) -> Result<(&str, &str)> {
    required(&request.temp_token, "Session token is required")?;
    let code = request.code.trim();
    if code.len() != 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::Validation("Code must be 6 digits".to_string()));
    }
    Ok((request.temp_token.trim(), code))
}

/// Password step of the admin login
async fn login(
    State(state): State<AppState>,
    context: RequestContext,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    required(&body.username, "Username is required")?;
    required(&body.password, "Password is required")?;

    let step = state
        .authenticator
        .login(body.username.trim(), &body.password, &context)
        .await?;

    Ok(Json(match step {
        LoginStep::CodeSent(handle) => LoginResponse::CodeSent(handle.into()),
        LoginStep::Authenticated(session) => LoginResponse::Authenticated(session.into()),
    }))
}

/// Code step of the admin login
async fn verify_login_code(
    State(state): State<AppState>,
    context: RequestContext,
    Json(body): Json<CodeRequest>,
) -> Result<Json<SessionResponse>> {
    let (token, code) = normalize_code(&body)?;

    let session = state
        .authenticator
        .complete_login(token, code, &context)
        .await?;

    Ok(Json(session.into()))
}

async fn request_password_change(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    context: RequestContext,
    Json(body): Json<PasswordChangeRequest>,
) -> Result<Json<CodeSentResponse>> {
    required(&body.current_password, "Current password is required")?;
    required(&body.new_password, "New password is required")?;

    let handle = state
        .authenticator
        .request_password_change(
            admin.admin_id,
            &body.current_password,
            &body.new_password,
            &context,
        )
        .await?;

    Ok(Json(handle.into()))
}

async fn verify_password_change(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    context: RequestContext,
    Json(body): Json<CodeRequest>,
) -> Result<Json<JsonValue>> {
    let (token, code) = normalize_code(&body)?;

    state
        .authenticator
        .complete_password_change(admin.admin_id, token, code, &context)
        .await?;

    Ok(Json(json!({ "message": "Password changed successfully" })))
}

async fn list_licenses(
    State(state): State<AppState>,
    context: RequestContext,
    Query(query): Query<LicenseListQuery>,
) -> Result<Json<LicensePage>> {
    let filter = LicenseFilter {
        status: query.status,
        tenant_name: query.search.filter(|s| !s.trim().is_empty()),
        plan: query.plan.filter(|p| !p.trim().is_empty()),
        license_key: query.license_key.filter(|k| !k.trim().is_empty()),
    };

    let page = state
        .licenses
        .list_licenses(
            &filter,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            &context,
        )
        .await?;

    Ok(Json(page))
}

async fn get_license(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<LicenseDetail>> {
    Ok(Json(state.licenses.license_detail(id, &context).await?))
}

async fn create_license(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthenticatedAdmin>,
    context: RequestContext,
    Json(body): Json<NewLicense>,
) -> Result<(StatusCode, Json<License>)> {
    let license = state.licenses.create_license(body, &context).await?;
    tracing::info!(license_id = %license.id, admin = %admin.username, "License issued");
    Ok((StatusCode::CREATED, Json(license)))
}

async fn update_license(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateLicenseData>,
) -> Result<Json<License>> {
    Ok(Json(state.licenses.update_license(id, body, &context).await?))
}

async fn delete_license(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>> {
    state.licenses.delete_license(id, &context).await?;
    Ok(Json(json!({ "message": "License deleted successfully" })))
}

async fn revoke_license(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<JsonValue>> {
    let license = state.licenses.revoke_license(id, &context).await?;
    Ok(Json(json!({
        "message": "License revoked successfully",
        "license": license,
    })))
}

async fn set_activation_status(
    State(state): State<AppState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
    Json(body): Json<ActivationStatusRequest>,
) -> Result<Json<Activation>> {
    let activation = state
        .licenses
        .set_activation_status(id, body.status, &context)
        .await?;
    Ok(Json(activation))
}

async fn dashboard_stats(
    State(state): State<AppState>,
    context: RequestContext,
) -> Result<Json<LicenseStats>> {
    Ok(Json(state.licenses.dashboard_stats(&context).await?))
}

async fn audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Vec<AuditLog>>> {
    let logs = state
        .licenses
        .audit_logs(
            query.license_id,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(logs))
}
