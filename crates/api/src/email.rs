//! Transactional security email delivery
//!
//! Outbound collaborator only: the core hands a rendered token URL or
//! code to this service and moves on. Delivery is fire-and-forget -
//! failures are logged but never fail the issuing operation
//! synchronously. Without an API key the service runs disabled and each
//! send is logged and skipped.

use serde_json::json;

use crate::config::Config;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct SecurityEmailService {
    api_key: Option<String>,
    from: String,
    base_url: String,
    client: reqwest::Client,
}

impl SecurityEmailService {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_key: config.resend_api_key.clone(),
            from: config.email_from.clone(),
            base_url: config.base_url.clone(),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn send_password_reset(&self, to: &str, token_value: &str) {
        let link = format!("{}/reset-password/{token_value}", self.base_url);
        self.send(
            to,
            "Reset your password",
            format!(
                "<p>A password reset was requested for your account.</p>\
                 <p><a href=\"{link}\">Choose a new password</a> (link valid for 1 hour).</p>\
                 <p>If this wasn't you, you can ignore this email.</p>"
            ),
        );
    }

    pub fn send_email_verification(&self, to: &str, token_value: &str) {
        let link = format!("{}/verify-email/{token_value}", self.base_url);
        self.send(
            to,
            "Verify your email address",
            format!(
                "<p>Welcome! Please confirm this address belongs to you.</p>\
                 <p><a href=\"{link}\">Verify email</a> (link valid for 24 hours).</p>"
            ),
        );
    }

    pub fn send_otp_code(&self, to: &str, code: &str) {
        self.send(
            to,
            "Your sign-in code",
            format!(
                "<p>Your one-time sign-in code is:</p>\
                 <p style=\"font-size:24px;letter-spacing:4px\"><strong>{code}</strong></p>\
                 <p>It expires in 10 minutes.</p>"
            ),
        );
    }

    /// Fire-and-forget delivery; the spawned task owns its own logging
    fn send(&self, to: &str, subject: &str, html: String) {
        let Some(api_key) = self.api_key.clone() else {
            tracing::warn!(to = %to, subject = %subject, "Email delivery disabled - skipping send");
            return;
        };

        let client = self.client.clone();
        let from = self.from.clone();
        let to = to.to_string();
        let subject = subject.to_string();

        tokio::spawn(async move {
            let body = json!({
                "from": from,
                "to": [to],
                "subject": subject,
                "html": html,
            });

            let result = client
                .post(RESEND_API_URL)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::info!(to = %body["to"], subject = %subject, "Security email sent");
                }
                Ok(response) => {
                    tracing::error!(
                        to = %body["to"],
                        status = %response.status(),
                        "Email API rejected delivery"
                    );
                }
                Err(e) => {
                    tracing::error!(to = %body["to"], error = %e, "Email delivery failed");
                }
            }
        });
    }
}
