#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use secrecy::Secret;
use tokio::sync::Mutex;

use hk_license::api::AppState;
use hk_license::config::{Config, StoreBackend};
use hk_license::jobs::challenge_cleanup;
use hk_license::models::admin_user::{AdminUser, CreateAdminData};
use hk_license::services::{
    license_admin::NewLicense,
    mailer::{CodeDispatcher, CodePurpose, DispatchReport},
    password,
};
use hk_license::store::{AdminStore, MemoryStore};

pub const ADMIN_PASSWORD: &str = "P1-password";

/// Keeps every code it is asked to deliver.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<(String, CodePurpose)>>,
    pub fail: bool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub async fn last_code(&self) -> String {
        self.sent
            .lock()
            .await
            .last()
            .map(|(code, _)| code.clone())
            .expect("no code was dispatched")
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl CodeDispatcher for RecordingDispatcher {
    async fn send(
        &self,
        code: &str,
        _recipient: &str,
        _username: &str,
        purpose: CodePurpose,
    ) -> DispatchReport {
        if self.fail {
            return DispatchReport::failed("relay down");
        }
        self.sent.lock().await.push((code.to_string(), purpose));
        DispatchReport::sent()
    }
}

pub fn config(two_factor_enabled: bool) -> Config {
    Config {
        store_backend: StoreBackend::Memory,
        database_url: None,
        database_max_connections: 1,
        host: "127.0.0.1".to_string(),
        port: 0,
        jwt_secret: Secret::new("integration-secret".to_string()),
        session_ttl_hours: 24,
        two_factor_enabled,
        challenge_ttl_minutes: 10,
        two_fa_email: "ops@example.com".to_string(),
        challenge_cleanup_cron: challenge_cleanup::DEFAULT_CRON.to_string(),
        mail_api_url: None,
        mail_api_token: None,
        mail_from: "no-reply@example.com".to_string(),
        mail_timeout_secs: 1,
        bootstrap_admin_username: None,
        bootstrap_admin_password: None,
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub state: AppState,
}

pub fn app_with(dispatcher: RecordingDispatcher, two_factor_enabled: bool) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(dispatcher);
    let state = AppState::new(
        store.clone(),
        dispatcher.clone(),
        &config(two_factor_enabled),
    );

    TestApp {
        store,
        dispatcher,
        state,
    }
}

pub fn app() -> TestApp {
    app_with(RecordingDispatcher::default(), true)
}

pub async fn seed_admin(store: &MemoryStore, username: &str) -> AdminUser {
    store
        .create_admin(CreateAdminData {
            username: username.to_string(),
            password_hash: password::hash_password(ADMIN_PASSWORD).unwrap(),
            role: "superadmin".to_string(),
        })
        .await
        .unwrap()
}

pub fn days_from_today(days: i64) -> NaiveDate {
    (Utc::now() + Duration::days(days)).date_naive()
}

pub fn new_license(license_key: &str, max_devices: i32, expiry_date: NaiveDate) -> NewLicense {
    NewLicense {
        tenant_name: "Lahore General Store".to_string(),
        plan: Some("standard".to_string()),
        max_devices: Some(max_devices),
        max_users: Some(3),
        features: None,
        start_date: None,
        expiry_date,
        license_key: Some(license_key.to_string()),
    }
}
