use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;

pub const NOT_CONFIGURED: &str = "Email service not configured";

/// Which flow a code belongs to; selects the message wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePurpose {
    Login,
    PasswordChange,
}

/// Delivery result. Dispatch failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: bool,
    pub error: Option<String>,
}

impl DispatchReport {
    pub fn sent() -> Self {
        Self {
            sent: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            sent: false,
            error: Some(error.into()),
        }
    }
}

/// Out-of-band channel for verification codes.
#[async_trait]
pub trait CodeDispatcher: Send + Sync {
    async fn send(
        &self,
        code: &str,
        recipient: &str,
        username: &str,
        purpose: CodePurpose,
    ) -> DispatchReport;
}

#[derive(thiserror::Error, Debug)]
pub enum MailerError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub api_url: Option<String>,
    pub api_token: Option<Secret<String>>,
    pub from: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OutgoingMail<'a> {
    from: &'a str,
    to: &'a str,
    subject: String,
    text: String,
    html: String,
}

struct Rendered {
    subject: String,
    text: String,
    html: String,
}

fn render(code: &str, username: &str, purpose: CodePurpose) -> Rendered {
    match purpose {
        CodePurpose::Login => Rendered {
            subject: format!("[HisaabKitab] Your login code: {}", code),
            text: format!(
                "Your HisaabKitab admin login code is: {}. It expires in 10 minutes.",
                code
            ),
            html: format!(
                "<h2>HisaabKitab License Admin - Login Verification</h2>\
                 <p>Someone is trying to log in to the admin panel as <strong>{}</strong>.</p>\
                 <p>Use this one-time code to complete login:</p>\
                 <p style=\"font-size: 28px; font-weight: bold; letter-spacing: 4px;\">{}</p>\
                 <p>This code expires in 10 minutes. If you did not request this, ignore this email.</p>",
                username, code
            ),
        },
        CodePurpose::PasswordChange => Rendered {
            subject: format!("[HisaabKitab] Password change verification code: {}", code),
            text: format!(
                "Your HisaabKitab admin password change verification code is: {}. \
                 It expires in 10 minutes. If you did not request this, please ignore this email.",
                code
            ),
            html: format!(
                "<h2>HisaabKitab License Admin - Password Change Verification</h2>\
                 <p>A password change has been requested for the admin account <strong>{}</strong>.</p>\
                 <p>Use this one-time code to confirm the password change:</p>\
                 <p style=\"font-size: 28px; font-weight: bold; letter-spacing: 4px;\">{}</p>\
                 <p>This code expires in 10 minutes. If you did not request this password change, \
                 please ignore this email and contact support immediately.</p>",
                username, code
            ),
        },
    }
}

/// Posts rendered messages as JSON to an HTTP mail relay.
pub struct HttpMailer {
    client: Client,
    config: MailerConfig,
}

impl HttpMailer {
    pub fn new(config: MailerConfig) -> Result<Self, MailerError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_url.is_some()
    }
}

#[async_trait]
impl CodeDispatcher for HttpMailer {
    #[tracing::instrument(skip(self, code, recipient))]
    async fn send(
        &self,
        code: &str,
        recipient: &str,
        username: &str,
        purpose: CodePurpose,
    ) -> DispatchReport {
        let Some(api_url) = self.config.api_url.as_deref() else {
            tracing::error!("Mail relay not configured; set MAIL_API_URL");
            return DispatchReport::failed(NOT_CONFIGURED);
        };

        let rendered = render(code, username, purpose);
        let mail = OutgoingMail {
            from: &self.config.from,
            to: recipient,
            subject: rendered.subject,
            text: rendered.text,
            html: rendered.html,
        };

        let mut request = self.client.post(api_url).json(&mail);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Verification code dispatched");
                DispatchReport::sent()
            }
            Ok(response) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                tracing::error!(%status, body = %body, "Mail relay rejected message");
                DispatchReport::failed(format!("Mail relay returned {}", status))
            }
            Err(e) => {
                tracing::error!(error = %e, timeout = e.is_timeout(), "Mail relay request failed");
                DispatchReport::failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mailer(api_url: Option<String>, timeout: Duration) -> HttpMailer {
        HttpMailer::new(MailerConfig {
            api_url,
            api_token: Some(Secret::new("relay-token".to_string())),
            from: "admin@hisaabkitab.test".to_string(),
            timeout,
        })
        .unwrap()
    }

    #[test]
    fn test_render_distinguishes_purposes() {
        let login = render("042917", "alice", CodePurpose::Login);
        let change = render("042917", "alice", CodePurpose::PasswordChange);

        assert!(login.subject.contains("login code: 042917"));
        assert!(change.subject.contains("Password change"));
        assert!(change.html.contains("<strong>alice</strong>"));
        assert_ne!(login.text, change.text);
    }

    #[tokio::test]
    async fn test_unconfigured_relay_reports_not_sent() {
        let report = mailer(None, Duration::from_secs(1))
            .send("123456", "ops@example.com", "alice", CodePurpose::Login)
            .await;

        assert_eq!(report, DispatchReport::failed(NOT_CONFIGURED));
    }

    #[tokio::test]
    async fn test_successful_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/send"))
            .and(header("authorization", "Bearer relay-token"))
            .and(body_partial_json(serde_json::json!({
                "to": "ops@example.com",
                "from": "admin@hisaabkitab.test",
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let report = mailer(Some(format!("{}/send", server.uri())), Duration::from_secs(5))
            .send("123456", "ops@example.com", "alice", CodePurpose::Login)
            .await;

        assert!(report.sent);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn test_relay_error_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("smtp down"))
            .mount(&server)
            .await;

        let report = mailer(Some(server.uri()), Duration::from_secs(5))
            .send("123456", "ops@example.com", "alice", CodePurpose::PasswordChange)
            .await;

        assert!(!report.sent);
        assert!(report.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_slow_relay_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let report = mailer(Some(server.uri()), Duration::from_millis(200))
            .send("123456", "ops@example.com", "alice", CodePurpose::Login)
            .await;

        assert!(!report.sent);
    }
}
