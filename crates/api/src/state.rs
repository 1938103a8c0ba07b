//! Application state
//!
//! Constructed once at process start, shared by reference (axum clones
//! are handle clones), closed with the process. Nothing in here is an
//! implicit singleton; every collaborator is injected through this
//! struct.

use sqlx::PgPool;

use yozakura_shared::RateLimiter;

use crate::auth::{AuthState, JwtManager, TokenManager, TotpManager};
use crate::config::Config;
use crate::email::SecurityEmailService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub token_manager: TokenManager,
    pub totp_manager: TotpManager,
    pub rate_limiter: RateLimiter,
    pub security_email: SecurityEmailService,
}

impl AppState {
    pub async fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.session_expiry_hours);
        let token_manager = TokenManager::new(pool.clone());
        let totp_manager = TotpManager::new(
            pool.clone(),
            config.totp_encryption_key,
            config.totp_issuer.clone(),
        );

        let rate_limiter = match &config.redis_url {
            Some(url) => RateLimiter::connect(url).await,
            None => {
                tracing::warn!("Rate limiter running in-process only (no REDIS_URL)");
                RateLimiter::new_in_memory()
            }
        };

        let security_email = SecurityEmailService::from_config(&config);
        if security_email.is_enabled() {
            tracing::info!("Security email delivery enabled");
        } else {
            tracing::warn!("Security email delivery not configured (missing RESEND_API_KEY)");
        }

        Self {
            pool,
            config,
            jwt_manager,
            token_manager,
            totp_manager,
            rate_limiter,
            security_email,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
