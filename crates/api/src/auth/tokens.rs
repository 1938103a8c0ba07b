//! Single-use, time-bound security tokens
//!
//! Purposes: password reset (1h), email verification (24h), email OTP
//! (10m). Only the SHA-256 digest of the random value touches the
//! database. State machine per token: issued -> consumed (terminal) or
//! issued -> expired (terminal, time-driven); nothing else.
//!
//! Single-use is enforced by a conditional atomic update on the consumed
//! flag, never read-then-write, so two concurrent requests cannot both
//! succeed with the same token. Flows that pair consumption with an
//! account mutation perform the mutation first and the consumed-flag flip
//! last: a crash in between leaves a retryable token, never an
//! unreachable account.

use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use yozakura_shared::with_retry;

use crate::error::{ApiError, ApiResult};

/// What an issued token is allowed to authorize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    PasswordReset,
    EmailVerification,
    EmailOtp,
}

impl TokenPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PasswordReset => "password_reset",
            Self::EmailVerification => "email_verification",
            Self::EmailOtp => "email_otp",
        }
    }

    /// Time-to-live per purpose
    pub fn ttl(self) -> time::Duration {
        match self {
            Self::PasswordReset => time::Duration::hours(1),
            Self::EmailVerification => time::Duration::hours(24),
            Self::EmailOtp => time::Duration::minutes(10),
        }
    }
}

/// A token that passed validation but has not been consumed yet
#[derive(Debug, Clone)]
pub struct ValidatedToken {
    pub id: Uuid,
    pub account_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: Uuid,
    account_id: Uuid,
    expires_at: OffsetDateTime,
    consumed_at: Option<OffsetDateTime>,
}

/// Issues, validates and consumes security tokens
#[derive(Clone)]
pub struct TokenManager {
    pool: PgPool,
}

impl TokenManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Issue a fresh token for `(account, purpose)`, invalidating any
    /// outstanding unconsumed token of the same purpose (supersession,
    /// not accumulation). Returns the plaintext value exactly once, for
    /// out-of-band delivery.
    pub async fn issue(&self, account_id: Uuid, purpose: TokenPurpose) -> ApiResult<String> {
        let value = generate_token_value(purpose);
        let value_hash = hash_token_value(&value);
        let expires_at = OffsetDateTime::now_utc() + purpose.ttl();

        with_retry(|| {
            let value_hash = value_hash.clone();
            async move {
                let mut tx = self.pool.begin().await?;

                // Supersede prior outstanding tokens of this purpose
                sqlx::query(
                    r#"
                    DELETE FROM security_tokens
                    WHERE account_id = $1
                      AND purpose = $2
                      AND consumed_at IS NULL
                    "#,
                )
                .bind(account_id)
                .bind(purpose.as_str())
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO security_tokens (account_id, purpose, token_hash, expires_at)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(account_id)
                .bind(purpose.as_str())
                .bind(&value_hash)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;

                tx.commit().await
            }
        })
        .await?;

        tracing::info!(
            account_id = %account_id,
            purpose = purpose.as_str(),
            "Security token issued"
        );

        Ok(value)
    }

    /// Look a token up by value without consuming it.
    ///
    /// Absent -> `TokenNotFound`, consumed -> `TokenAlreadyUsed`, past
    /// expiry -> `TokenExpired`. Only for high-entropy purposes; email
    /// OTP codes go through [`Self::validate_for_account`].
    pub async fn validate(
        &self,
        value: &str,
        purpose: TokenPurpose,
    ) -> ApiResult<ValidatedToken> {
        self.lookup(value, purpose, None).await
    }

    /// Account-scoped validation for short numeric codes, where the same
    /// value may legitimately be outstanding for two accounts at once.
    pub async fn validate_for_account(
        &self,
        account_id: Uuid,
        value: &str,
        purpose: TokenPurpose,
    ) -> ApiResult<ValidatedToken> {
        self.lookup(value, purpose, Some(account_id)).await
    }

    async fn lookup(
        &self,
        value: &str,
        purpose: TokenPurpose,
        account_id: Option<Uuid>,
    ) -> ApiResult<ValidatedToken> {
        let value_hash = hash_token_value(value);

        let row: Option<TokenRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, expires_at, consumed_at
            FROM security_tokens
            WHERE token_hash = $1
              AND purpose = $2
              AND ($3::uuid IS NULL OR account_id = $3)
            "#,
        )
        .bind(&value_hash)
        .bind(purpose.as_str())
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(ApiError::TokenNotFound)?;

        if row.consumed_at.is_some() {
            return Err(ApiError::TokenAlreadyUsed);
        }
        if row.expires_at <= OffsetDateTime::now_utc() {
            return Err(ApiError::TokenExpired);
        }

        Ok(ValidatedToken {
            id: row.id,
            account_id: row.account_id,
        })
    }

    /// Flip the consumed flag - the single irreversible transition.
    ///
    /// Compare-and-set on `consumed_at IS NULL`; the loser of a race gets
    /// `TokenAlreadyUsed`. Callers with a dependent account mutation run
    /// the mutation before this call.
    pub async fn consume_validated(&self, token_id: Uuid) -> ApiResult<()> {
        let rows_affected = with_retry(|| async {
            sqlx::query(
                r#"
                UPDATE security_tokens
                SET consumed_at = NOW()
                WHERE id = $1
                  AND consumed_at IS NULL
                "#,
            )
            .bind(token_id)
            .execute(&self.pool)
            .await
        })
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(ApiError::TokenAlreadyUsed);
        }
        Ok(())
    }

    /// Validate and consume in one call, scoped to the account, for
    /// email OTP codes (no dependent account mutation)
    pub async fn consume_for_account(
        &self,
        account_id: Uuid,
        value: &str,
        purpose: TokenPurpose,
    ) -> ApiResult<Uuid> {
        let token = self.validate_for_account(account_id, value, purpose).await?;
        self.consume_validated(token.id).await?;

        tracing::info!(
            account_id = %token.account_id,
            purpose = purpose.as_str(),
            "Security token consumed"
        );

        Ok(token.account_id)
    }
}

/// Generate the plaintext token value for a purpose.
///
/// Email OTP codes are short numeric values meant to be typed from an
/// inbox; everything else is 256 bits of hex for URL embedding.
fn generate_token_value(purpose: TokenPurpose) -> String {
    match purpose {
        TokenPurpose::EmailOtp => {
            let code: u32 = rand::rng().random_range(0..1_000_000);
            format!("{code:06}")
        }
        _ => {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    }
}

/// Storage digest of a token value
fn hash_token_value(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purposes_map_to_stable_column_values() {
        assert_eq!(TokenPurpose::PasswordReset.as_str(), "password_reset");
        assert_eq!(
            TokenPurpose::EmailVerification.as_str(),
            "email_verification"
        );
        assert_eq!(TokenPurpose::EmailOtp.as_str(), "email_otp");
    }

    #[test]
    fn ttls_follow_the_purpose() {
        assert_eq!(TokenPurpose::PasswordReset.ttl(), time::Duration::hours(1));
        assert_eq!(
            TokenPurpose::EmailVerification.ttl(),
            time::Duration::hours(24)
        );
        assert_eq!(TokenPurpose::EmailOtp.ttl(), time::Duration::minutes(10));
    }

    #[test]
    fn reset_values_carry_256_bits() {
        let value = generate_token_value(TokenPurpose::PasswordReset);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn otp_values_are_six_digits() {
        for _ in 0..64 {
            let code = generate_token_value(TokenPurpose::EmailOtp);
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn values_do_not_repeat() {
        let a = generate_token_value(TokenPurpose::PasswordReset);
        let b = generate_token_value(TokenPurpose::PasswordReset);
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_deterministic_and_not_the_value() {
        let value = generate_token_value(TokenPurpose::PasswordReset);
        let digest = hash_token_value(&value);
        assert_eq!(digest, hash_token_value(&value));
        assert_ne!(digest, value);
    }
}
