//! Store-backed lifecycle tests for security tokens and backup codes
//!
//! Tests cover:
//! - Single-use enforcement (second consume loses the CAS)
//! - Supersession (issuing invalidates the outstanding token)
//! - TTL expiry
//! - Backup-code consumption (each code spendable exactly once)
//!
//! These run only when `DATABASE_URL` points at a migrated test
//! database; without it each test returns early.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use super::accounts::{self, Account};
use super::tokens::{TokenManager, TokenPurpose};
use super::totp::TotpManager;
use crate::error::ApiError;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to test database");
    sqlx::migrate!().run(&pool).await.expect("run migrations");
    Some(pool)
}

async fn create_test_account(pool: &PgPool) -> Account {
    let email = format!("{}@example.com", Uuid::new_v4());
    accounts::create_account(pool, &email, "Correct-Horse-9", None)
        .await
        .expect("create account")
}

#[tokio::test]
async fn a_token_is_consumed_exactly_once() {
    let Some(pool) = test_pool().await else { return };
    let account = create_test_account(&pool).await;
    let tokens = TokenManager::new(pool);

    let value = tokens
        .issue(account.id, TokenPurpose::PasswordReset)
        .await
        .expect("issue");

    let validated = tokens
        .validate(&value, TokenPurpose::PasswordReset)
        .await
        .expect("validate");
    tokens
        .consume_validated(validated.id)
        .await
        .expect("first consume");

    // The CAS has flipped; both re-consume and re-validate must refuse
    assert!(matches!(
        tokens.consume_validated(validated.id).await,
        Err(ApiError::TokenAlreadyUsed)
    ));
    assert!(matches!(
        tokens.validate(&value, TokenPurpose::PasswordReset).await,
        Err(ApiError::TokenAlreadyUsed)
    ));
}

#[tokio::test]
async fn issuing_supersedes_the_outstanding_token() {
    let Some(pool) = test_pool().await else { return };
    let account = create_test_account(&pool).await;
    let tokens = TokenManager::new(pool);

    let first = tokens
        .issue(account.id, TokenPurpose::PasswordReset)
        .await
        .expect("issue first");
    let second = tokens
        .issue(account.id, TokenPurpose::PasswordReset)
        .await
        .expect("issue second");

    assert!(matches!(
        tokens.validate(&first, TokenPurpose::PasswordReset).await,
        Err(ApiError::TokenNotFound)
    ));
    assert!(tokens
        .validate(&second, TokenPurpose::PasswordReset)
        .await
        .is_ok());
}

#[tokio::test]
async fn supersession_is_scoped_to_the_purpose() {
    let Some(pool) = test_pool().await else { return };
    let account = create_test_account(&pool).await;
    let tokens = TokenManager::new(pool);

    let verification = tokens
        .issue(account.id, TokenPurpose::EmailVerification)
        .await
        .expect("issue verification");
    tokens
        .issue(account.id, TokenPurpose::PasswordReset)
        .await
        .expect("issue reset");

    // A reset issue must not invalidate the verification token
    assert!(tokens
        .validate(&verification, TokenPurpose::EmailVerification)
        .await
        .is_ok());
}

#[tokio::test]
async fn an_expired_token_reports_token_expired() {
    let Some(pool) = test_pool().await else { return };
    let account = create_test_account(&pool).await;
    let tokens = TokenManager::new(pool.clone());

    let value = tokens
        .issue(account.id, TokenPurpose::PasswordReset)
        .await
        .expect("issue");

    sqlx::query(
        "UPDATE security_tokens SET expires_at = NOW() - INTERVAL '1 minute' WHERE account_id = $1",
    )
    .bind(account.id)
    .execute(&pool)
    .await
    .expect("age the token");

    assert!(matches!(
        tokens.validate(&value, TokenPurpose::PasswordReset).await,
        Err(ApiError::TokenExpired)
    ));
}

#[tokio::test]
async fn a_backup_code_is_spent_exactly_once() {
    let Some(pool) = test_pool().await else { return };
    let account = create_test_account(&pool).await;
    let totp = TotpManager::new(pool.clone(), [7u8; 32], "Yozakura".to_string());

    let setup = totp.begin_setup(&account).await.expect("begin setup");

    // Skip code confirmation; flip the enrollment flag directly
    sqlx::query("UPDATE accounts SET totp_enabled = TRUE WHERE id = $1")
        .bind(account.id)
        .execute(&pool)
        .await
        .expect("enable");

    let code = setup.backup_codes[0].clone();

    let enrolled = accounts::find_by_id(&pool, account.id).await.expect("fetch");
    totp.verify_challenge(&enrolled, &code)
        .await
        .expect("first spend");

    let after_spend = accounts::find_by_id(&pool, account.id).await.expect("fetch");
    assert!(matches!(
        totp.verify_challenge(&after_spend, &code).await,
        Err(ApiError::InvalidCode)
    ));

    // The remaining codes are unaffected
    totp.verify_challenge(&after_spend, &setup.backup_codes[1])
        .await
        .expect("different code still spendable");
}
