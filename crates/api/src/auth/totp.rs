//! TOTP enrollment and challenge
//!
//! Enrollment is a two-step state machine: `begin_setup` persists an
//! encrypted secret and hashed backup codes in a pending state that is
//! not yet trusted for login; `confirm_setup` transitions to enrolled
//! only when the submitted code proves the authenticator holds the
//! secret. A failed confirmation leaves the pending state untouched, so
//! setup can be retried or abandoned without side effects.
//!
//! Secrets are AES-256-GCM encrypted at rest (nonce prepended to the
//! ciphertext). Backup codes are stored as SHA-256 digests and each one
//! is consumable exactly once: removal is an atomic conditional update on
//! the array, so two concurrent challenges cannot both spend the same
//! code.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::{Choice, ConstantTimeEq};
use totp_rs::{Algorithm, Secret, TOTP};

use yozakura_shared::with_retry;

use super::accounts::Account;
use super::password::verify_password;
use crate::error::{ApiError, ApiResult};

/// Number of one-time backup codes generated at enrollment
const BACKUP_CODE_COUNT: usize = 10;

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Everything the client sees exactly once at enrollment start
#[derive(Debug)]
pub struct TotpSetup {
    /// Base32 secret for manual entry
    pub secret: String,
    /// otpauth:// provisioning URI
    pub provisioning_uri: String,
    /// PNG QR code of the URI, base64-encoded
    pub qr_png_base64: String,
    /// Plaintext backup codes - shown once, never retrievable again
    pub backup_codes: Vec<String>,
}

/// TOTP secret / backup-code lifecycle and sign-in challenge
#[derive(Clone)]
pub struct TotpManager {
    pool: PgPool,
    encryption_key: [u8; 32],
    issuer: String,
}

impl TotpManager {
    pub fn new(pool: PgPool, encryption_key: [u8; 32], issuer: String) -> Self {
        Self {
            pool,
            encryption_key,
            issuer,
        }
    }

    /// Start enrollment: generate a secret and backup codes, persist only
    /// the encrypted secret and the code digests, in a pending state not
    /// yet trusted for login.
    pub async fn begin_setup(&self, account: &Account) -> ApiResult<TotpSetup> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| ApiError::internal(format!("TOTP secret generation failed: {e:?}")))?;

        let totp = self.build_totp(secret_bytes.clone(), &account.email)?;
        let provisioning_uri = totp.get_url();
        let qr_png_base64 = render_qr_png(&provisioning_uri)?;

        let backup_codes: Vec<String> =
            (0..BACKUP_CODE_COUNT).map(|_| generate_backup_code()).collect();
        let code_hashes: Vec<String> =
            backup_codes.iter().map(|c| hash_backup_code(c)).collect();

        let secret_enc = encrypt_secret(&self.encryption_key, &secret_bytes)?;

        let account_id = account.id;
        with_retry(|| {
            let secret_enc = secret_enc.clone();
            let code_hashes = code_hashes.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET totp_secret_enc = $2,
                        totp_enabled = FALSE,
                        backup_codes = $3,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(account_id)
                .bind(&secret_enc)
                .bind(&code_hashes)
                .execute(&self.pool)
                .await
            }
        })
        .await?;

        tracing::info!(account_id = %account.id, "TOTP enrollment started (pending verification)");

        Ok(TotpSetup {
            secret: secret.to_encoded().to_string(),
            provisioning_uri,
            qr_png_base64,
            backup_codes,
        })
    }

    /// Complete enrollment: the submitted code must match the pending
    /// secret within +/-1 time step. A mismatch is `InvalidCode` and the
    /// state stays pending.
    pub async fn confirm_setup(&self, account: &Account, submitted_code: &str) -> ApiResult<()> {
        if account.totp_enabled {
            // Already enrolled; nothing pending to confirm
            return Err(ApiError::InvalidCode);
        }
        let secret_enc = account
            .totp_secret_enc
            .as_deref()
            .ok_or(ApiError::InvalidCode)?;

        if !self.check_code(secret_enc, &account.email, submitted_code)? {
            return Err(ApiError::InvalidCode);
        }

        let account_id = account.id;
        with_retry(|| async move {
            sqlx::query(
                r#"
                UPDATE accounts
                SET totp_enabled = TRUE, updated_at = NOW()
                WHERE id = $1
                  AND totp_secret_enc IS NOT NULL
                "#,
            )
            .bind(account_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        tracing::info!(account_id = %account.id, "TOTP enrolled");
        Ok(())
    }

    /// Disable TOTP after credential re-confirmation; clears the secret
    /// and all backup codes.
    pub async fn disable(&self, account: &Account, password: &str) -> ApiResult<()> {
        if !verify_password(password, &account.password_hash) {
            return Err(ApiError::InvalidCredentials);
        }

        let account_id = account.id;
        with_retry(|| async move {
            sqlx::query(
                r#"
                UPDATE accounts
                SET totp_secret_enc = NULL,
                    totp_enabled = FALSE,
                    backup_codes = '{}',
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(account_id)
            .execute(&self.pool)
            .await
        })
        .await?;

        tracing::info!(account_id = %account.id, "TOTP disabled");
        Ok(())
    }

    /// Sign-in challenge: accept the live time-step code (+/-1 skew) or,
    /// failing that, consume one unused backup code.
    pub async fn verify_challenge(&self, account: &Account, code: &str) -> ApiResult<()> {
        if !account.totp_enabled {
            return Err(ApiError::InvalidCode);
        }
        let secret_enc = account
            .totp_secret_enc
            .as_deref()
            .ok_or(ApiError::InvalidCode)?;

        if self.check_code(secret_enc, &account.email, code)? {
            return Ok(());
        }

        if self.consume_backup_code(account, code).await? {
            tracing::info!(account_id = %account.id, "Backup code consumed for MFA challenge");
            return Ok(());
        }

        Err(ApiError::InvalidCode)
    }

    /// Atomically spend a backup code: the array removal is conditioned
    /// on membership, so exactly one of two concurrent requests wins.
    async fn consume_backup_code(&self, account: &Account, code: &str) -> ApiResult<bool> {
        let code_hash = hash_backup_code(&code.trim().to_uppercase());

        // Constant-time membership scan before touching the store
        if !contains_hash(&account.backup_codes, &code_hash) {
            return Ok(false);
        }

        let account_id = account.id;
        let rows_affected = with_retry(|| {
            let code_hash = code_hash.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE accounts
                    SET backup_codes = array_remove(backup_codes, $2),
                        updated_at = NOW()
                    WHERE id = $1
                      AND $2 = ANY(backup_codes)
                    "#,
                )
                .bind(account_id)
                .bind(&code_hash)
                .execute(&self.pool)
                .await
            }
        })
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    fn check_code(&self, secret_enc: &[u8], email: &str, code: &str) -> ApiResult<bool> {
        let secret_bytes = decrypt_secret(&self.encryption_key, secret_enc)?;
        let totp = self.build_totp(secret_bytes, email)?;
        Ok(totp
            .check_current(code.trim())
            .unwrap_or(false))
    }

    fn build_totp(&self, secret_bytes: Vec<u8>, account_label: &str) -> ApiResult<TOTP> {
        // 6 digits, 30s step, skew of 1 step either side
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some(self.issuer.clone()),
            account_label.to_string(),
        )
        .map_err(|e| ApiError::internal(format!("TOTP construction failed: {e:?}")))
    }
}

/// `XXXX-XXXX` one-time fallback credential
fn generate_backup_code() -> String {
    let raw: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_uppercase();
    format!("{}-{}", &raw[..4], &raw[4..])
}

fn hash_backup_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

/// Constant-time scan of the stored digest set
fn contains_hash(stored: &[String], candidate: &str) -> bool {
    let mut matched = Choice::from(0u8);
    for hash in stored {
        matched |= hash.as_bytes().ct_eq(candidate.as_bytes());
    }
    bool::from(matched)
}

fn encrypt_secret(key: &[u8; 32], plaintext: &[u8]) -> ApiResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ApiError::internal(format!("Cipher init failed: {e}")))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ApiError::internal(format!("Secret encryption failed: {e}")))?;

    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

fn decrypt_secret(key: &[u8; 32], blob: &[u8]) -> ApiResult<Vec<u8>> {
    if blob.len() <= NONCE_LEN {
        return Err(ApiError::internal("Stored TOTP secret is truncated"));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ApiError::internal(format!("Cipher init failed: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ApiError::internal("Stored TOTP secret failed to decrypt"))
}

/// Render the provisioning URI as a base64 PNG for inline display
fn render_qr_png(uri: &str) -> ApiResult<String> {
    let qr = qrcode::QrCode::new(uri)
        .map_err(|e| ApiError::internal(format!("QR encoding failed: {e}")))?;
    let image = qr.render::<image::Luma<u8>>().build();

    let mut png_bytes = Vec::new();
    image::DynamicImage::ImageLuma8(image)
        .write_to(
            &mut std::io::Cursor::new(&mut png_bytes),
            image::ImageFormat::Png,
        )
        .map_err(|e| ApiError::internal(format!("QR rendering failed: {e}")))?;

    Ok(BASE64.encode(png_bytes))
}
