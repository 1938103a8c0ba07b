//! Email one-time-code second factor
//!
//! Enablement is a flag toggle (disable requires credential
//! re-confirmation). The runtime challenge rides the security-token
//! machinery: a short numeric code stored as a 10-minute single-use token
//! with purpose `email_otp`, scoped to the account because short codes
//! collide.

use sqlx::PgPool;
use uuid::Uuid;

use yozakura_shared::with_retry;

use super::accounts::Account;
use super::password::verify_password;
use super::tokens::{TokenManager, TokenPurpose};
use crate::error::{ApiError, ApiResult};

pub async fn enable(pool: &PgPool, account_id: Uuid) -> ApiResult<()> {
    with_retry(|| async {
        sqlx::query(
            "UPDATE accounts SET email_otp_enabled = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(pool)
        .await
    })
    .await?;

    tracing::info!(account_id = %account_id, "Email OTP enabled");
    Ok(())
}

/// Disable requires the current password, like every MFA downgrade
pub async fn disable(pool: &PgPool, account: &Account, password: &str) -> ApiResult<()> {
    if !verify_password(password, &account.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let account_id = account.id;
    with_retry(|| async move {
        sqlx::query(
            "UPDATE accounts SET email_otp_enabled = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(pool)
        .await
    })
    .await?;

    tracing::info!(account_id = %account.id, "Email OTP disabled");
    Ok(())
}

/// Generate and persist a fresh code for the challenge. Issuing
/// supersedes any outstanding unconsumed code for the account. The
/// caller hands the returned plaintext to the email collaborator.
pub async fn issue(tokens: &TokenManager, account: &Account) -> ApiResult<String> {
    if !account.email_otp_enabled {
        return Err(ApiError::InvalidCode);
    }
    tokens.issue(account.id, TokenPurpose::EmailOtp).await
}

/// Verify and consume a submitted code - single-use, like every security
/// token.
pub async fn verify(tokens: &TokenManager, account_id: Uuid, code: &str) -> ApiResult<()> {
    tokens
        .consume_for_account(account_id, code.trim(), TokenPurpose::EmailOtp)
        .await
        .map_err(|e| match e {
            // A wrong or stale code is just an invalid code to the caller
            ApiError::TokenNotFound | ApiError::TokenExpired | ApiError::TokenAlreadyUsed => {
                ApiError::InvalidCode
            }
            other => other,
        })?;
    Ok(())
}
