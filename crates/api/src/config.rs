//! Environment configuration
//!
//! Required variables fail fast at startup; optional ones log a warning
//! and select a degraded or disabled mode (no Redis means in-process rate
//! limiting, no email API key means delivery is logged and skipped).

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Application configuration, loaded once at process start and shared by
/// reference through `AppState`.
#[derive(Clone)]
pub struct Config {
    /// Postgres connection string
    pub database_url: String,
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// HS256 signing secret for session and MFA-challenge tokens
    pub jwt_secret: String,
    /// Session token lifetime in hours (default: 7 days)
    pub session_expiry_hours: i64,
    /// Redis connection string; absence triggers the in-process
    /// rate-limiter fallback
    pub redis_url: Option<String>,
    /// 32-byte AES-256-GCM key for TOTP secrets at rest
    pub totp_encryption_key: [u8; 32],
    /// Issuer label shown in authenticator apps
    pub totp_issuer: String,
    /// Public base URL embedded in emailed links
    pub base_url: String,
    /// Resend API key; absence disables outbound email
    pub resend_api_key: Option<String>,
    /// From address for transactional email
    pub email_from: String,

    // Rate-limit thresholds (attempts / window seconds)
    pub signin_max_attempts: u64,
    pub signin_window_secs: u64,
    pub reset_request_max_attempts: u64,
    pub reset_request_window_secs: u64,
    pub otp_issue_max_attempts: u64,
    pub otp_issue_window_secs: u64,
    pub mfa_max_attempts: u64,
    pub mfa_window_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        let jwt_secret = required("JWT_SECRET")?;
        anyhow::ensure!(
            jwt_secret.len() >= 32,
            "JWT_SECRET must be at least 32 bytes"
        );

        let totp_encryption_key = decode_totp_key(&required("TOTP_ENCRYPTION_KEY")?)?;

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        if redis_url.is_none() {
            tracing::warn!(
                "REDIS_URL not set - rate limiting degrades to in-process counters (single instance only)"
            );
        }

        let resend_api_key = std::env::var("RESEND_API_KEY")
            .ok()
            .filter(|s| !s.is_empty());
        if resend_api_key.is_none() {
            tracing::warn!("RESEND_API_KEY not set - outbound email disabled");
        }

        Ok(Self {
            database_url,
            bind_address: var_or("BIND_ADDRESS", "0.0.0.0:8080"),
            jwt_secret,
            session_expiry_hours: parse_or("SESSION_EXPIRY_HOURS", 168)?,
            redis_url,
            totp_encryption_key,
            totp_issuer: var_or("TOTP_ISSUER", "Yozakura"),
            base_url: var_or("BASE_URL", "http://localhost:3000"),
            resend_api_key,
            email_from: var_or("EMAIL_FROM", "security@yozakura.app"),
            signin_max_attempts: parse_or("SIGNIN_MAX_ATTEMPTS", 5)?,
            signin_window_secs: parse_or("SIGNIN_WINDOW_SECS", 300)?,
            reset_request_max_attempts: parse_or("RESET_REQUEST_MAX_ATTEMPTS", 3)?,
            reset_request_window_secs: parse_or("RESET_REQUEST_WINDOW_SECS", 3600)?,
            otp_issue_max_attempts: parse_or("OTP_ISSUE_MAX_ATTEMPTS", 3)?,
            otp_issue_window_secs: parse_or("OTP_ISSUE_WINDOW_SECS", 600)?,
            mfa_max_attempts: parse_or("MFA_MAX_ATTEMPTS", 5)?,
            mfa_window_secs: parse_or("MFA_WINDOW_SECS", 900)?,
        })
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("{name} is not valid")),
        Err(_) => Ok(default),
    }
}

fn decode_totp_key(raw: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = BASE64
        .decode(raw)
        .context("TOTP_ENCRYPTION_KEY is not valid base64")?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("TOTP_ENCRYPTION_KEY must decode to exactly 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_minimum_env() {
        std::env::set_var("DATABASE_URL", "postgresql://localhost/yozakura_test");
        std::env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-key-at-least-32-bytes-long",
        );
        std::env::set_var("TOTP_ENCRYPTION_KEY", BASE64.encode([7u8; 32]));
        std::env::remove_var("REDIS_URL");
        std::env::remove_var("RESEND_API_KEY");
        std::env::remove_var("SESSION_EXPIRY_HOURS");
    }

    #[test]
    #[serial]
    fn loads_with_defaults() {
        set_minimum_env();

        let config = Config::from_env().unwrap();
        assert_eq!(config.session_expiry_hours, 168);
        assert_eq!(config.signin_max_attempts, 5);
        assert!(config.redis_url.is_none());
        assert_eq!(config.totp_encryption_key, [7u8; 32]);
    }

    #[test]
    #[serial]
    fn rejects_short_jwt_secret() {
        set_minimum_env();
        std::env::set_var("JWT_SECRET", "too-short");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn rejects_wrong_size_totp_key() {
        set_minimum_env();
        std::env::set_var("TOTP_ENCRYPTION_KEY", BASE64.encode([7u8; 16]));

        assert!(Config::from_env().is_err());
    }
}
