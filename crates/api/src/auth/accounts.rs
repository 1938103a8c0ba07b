//! Credential vault: account records and credential verification
//!
//! Accounts are mutated only through the explicit operations here and in
//! the MFA engine; the auth core never deletes one. Email uniqueness is
//! case-insensitive and enforced by the database unique index, so
//! concurrent signups cannot both win.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use yozakura_shared::with_retry;

use super::password::{
    generate_impossible_hash, hash_password, validate_password_strength, verify_password,
};
use crate::error::{ApiError, ApiResult};

pub const ROLE_DEFAULT: &str = "default";
pub const ROLE_ADMIN: &str = "admin";

/// Account identity record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub password_hash: String,
    pub role: String,
    pub email_verified: bool,
    pub totp_secret_enc: Option<Vec<u8>>,
    pub totp_enabled: bool,
    pub email_otp_enabled: bool,
    pub backup_codes: Vec<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// Any enabled second factor forces the MFA challenge at sign-in
    pub fn mfa_enabled(&self) -> bool {
        self.totp_enabled || self.email_otp_enabled
    }
}

/// Canonical form used for lookups; the stored value keeps its case for
/// display.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Create an account with a salted one-way hash; the plaintext never
/// leaves this function. Fails with `DuplicateAccount` when the
/// case-insensitive unique index rejects the email, `PolicyViolation`
/// when the password is weak.
pub async fn create_account(
    pool: &PgPool,
    email: &str,
    password: &str,
    display_name: Option<&str>,
) -> ApiResult<Account> {
    validate_password_strength(password)?;
    let password_hash = hash_password(password)?;

    let account = with_retry(|| {
        let password_hash = password_hash.clone();
        async move {
            sqlx::query_as::<_, Account>(
                r#"
                INSERT INTO accounts (email, display_name, password_hash)
                VALUES ($1, $2, $3)
                RETURNING *
                "#,
            )
            .bind(email.trim())
            .bind(display_name)
            .bind(&password_hash)
            .fetch_one(pool)
            .await
        }
    })
    .await
    .map_err(map_duplicate_email)?;

    tracing::info!(account_id = %account.id, "Account created");
    Ok(account)
}

pub async fn find_by_email(pool: &PgPool, email: &str) -> ApiResult<Option<Account>> {
    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE LOWER(email) = $1",
    )
    .bind(normalize_email(email))
    .fetch_optional(pool)
    .await?;
    Ok(account)
}

pub async fn find_by_id(pool: &PgPool, account_id: Uuid) -> ApiResult<Account> {
    sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::Unauthenticated)
}

/// Verify email + password.
///
/// "No such account" and "wrong password" return the same error, and the
/// missing-account path burns an argon2 verification against an
/// impossible hash so the two are not distinguishable by timing either.
pub async fn verify_credentials(pool: &PgPool, email: &str, password: &str) -> ApiResult<Account> {
    match find_by_email(pool, email).await? {
        Some(account) => {
            if verify_password(password, &account.password_hash) {
                Ok(account)
            } else {
                Err(ApiError::InvalidCredentials)
            }
        }
        None => {
            let decoy = generate_impossible_hash()?;
            let _ = verify_password(password, &decoy);
            Err(ApiError::InvalidCredentials)
        }
    }
}

/// Change password with current-password re-confirmation. The policy is
/// the same one signup enforces.
pub async fn change_password(
    pool: &PgPool,
    account_id: Uuid,
    current_password: &str,
    new_password: &str,
) -> ApiResult<()> {
    let account = find_by_id(pool, account_id).await?;
    if !verify_password(current_password, &account.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    validate_password_strength(new_password)?;
    let password_hash = hash_password(new_password)?;
    update_password_hash(pool, account_id, &password_hash).await?;

    tracing::info!(account_id = %account_id, "Password changed");
    Ok(())
}

/// Store a new password hash. Shared by change-password and the
/// reset-token flow (which validates policy and ownership first).
pub async fn update_password_hash(
    pool: &PgPool,
    account_id: Uuid,
    password_hash: &str,
) -> ApiResult<()> {
    with_retry(|| async {
        sqlx::query(
            "UPDATE accounts SET password_hash = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .bind(password_hash)
        .execute(pool)
        .await
    })
    .await?;
    Ok(())
}

/// Change email with current-password re-confirmation. The new address
/// starts unverified; the caller re-triggers the verification flow.
pub async fn change_email(
    pool: &PgPool,
    account_id: Uuid,
    password: &str,
    new_email: &str,
) -> ApiResult<Account> {
    let account = find_by_id(pool, account_id).await?;
    if !verify_password(password, &account.password_hash) {
        return Err(ApiError::InvalidCredentials);
    }

    let updated = with_retry(|| async {
        sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET email = $2, email_verified = FALSE, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(new_email.trim())
        .fetch_one(pool)
        .await
    })
    .await
    .map_err(map_duplicate_email)?;

    tracing::info!(account_id = %account_id, "Email changed, verification reset");
    Ok(updated)
}

pub async fn mark_email_verified(pool: &PgPool, account_id: Uuid) -> ApiResult<()> {
    with_retry(|| async {
        sqlx::query(
            "UPDATE accounts SET email_verified = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(account_id)
        .execute(pool)
        .await
    })
    .await?;
    Ok(())
}

/// Unique-violation on the email index means the address is taken;
/// everything else flows through the normal store-error mapping.
fn map_duplicate_email(error: sqlx::Error) -> ApiError {
    if let sqlx::Error::Database(db) = &error {
        if db.code().as_deref() == Some("23505") {
            return ApiError::DuplicateAccount;
        }
    }
    error.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_normalization_is_case_insensitive() {
        assert_eq!(normalize_email("  Aoi@Example.COM "), "aoi@example.com");
    }

    #[test]
    fn mfa_enabled_when_either_factor_is_on() {
        let mut account = test_account();
        assert!(!account.mfa_enabled());

        account.totp_enabled = true;
        assert!(account.mfa_enabled());

        account.totp_enabled = false;
        account.email_otp_enabled = true;
        assert!(account.mfa_enabled());
    }

    fn test_account() -> Account {
        Account {
            id: Uuid::new_v4(),
            email: "aoi@example.com".to_string(),
            display_name: None,
            password_hash: "x".to_string(),
            role: ROLE_DEFAULT.to_string(),
            email_verified: false,
            totp_secret_enc: None,
            totp_enabled: false,
            email_otp_enabled: false,
            backup_codes: vec![],
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }
}
