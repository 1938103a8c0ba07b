//! Password hashing and policy
//!
//! Argon2id with per-hash random salts. Verification is constant-time
//! inside argon2; the enumeration-resistance trick for nonexistent
//! accounts is [`generate_impossible_hash`], which gives the missing-
//! account path the same cost and error shape as a wrong password.

use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::error::{ApiError, ApiResult};

/// Hash a password with a fresh random salt
pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(format!("Password hashing failed: {e}")))
}

/// Verify a password against a stored hash
///
/// Malformed stored hashes verify as false rather than erroring - a
/// corrupt row must not become an oracle.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Hash of a random 32-byte value no submitted password can match.
///
/// Used when the looked-up account does not exist, so the credential
/// check performs the same argon2 work either way.
pub fn generate_impossible_hash() -> ApiResult<String> {
    let mut random_secret = [0u8; 32];
    OsRng.fill_bytes(&mut random_secret);

    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(&random_secret, &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(format!("Password hashing failed: {e}")))
}

/// Password policy, enforced identically on signup, change and reset:
/// at least 8 characters with upper case, lower case, a digit and a
/// symbol.
pub fn validate_password_strength(password: &str) -> ApiResult<()> {
    if password.len() < 8 {
        return Err(ApiError::PolicyViolation(
            "password must be at least 8 characters".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ApiError::PolicyViolation(
            "password must contain an upper-case letter".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ApiError::PolicyViolation(
            "password must contain a lower-case letter".to_string(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ApiError::PolicyViolation(
            "password must contain a digit".to_string(),
        ));
    }
    if !password.chars().any(|c| !c.is_alphanumeric()) {
        return Err(ApiError::PolicyViolation(
            "password must contain a symbol".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("Correct-Horse-9").unwrap();
        assert!(verify_password("Correct-Horse-9", &hash));
        assert!(!verify_password("Wrong-Horse-9", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("Correct-Horse-9").unwrap();
        let b = hash_password("Correct-Horse-9").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        assert!(!verify_password("anything", "not-a-phc-string"));
    }

    #[test]
    fn impossible_hash_matches_nothing_common() {
        let hash = generate_impossible_hash().unwrap();
        assert!(!verify_password("", &hash));
        assert!(!verify_password("password", &hash));
        assert!(!verify_password("Correct-Horse-9", &hash));
    }

    #[test]
    fn policy_rejects_each_missing_class() {
        assert!(validate_password_strength("Ab1!x").is_err()); // too short
        assert!(validate_password_strength("alllower1!").is_err()); // no upper
        assert!(validate_password_strength("ALLUPPER1!").is_err()); // no lower
        assert!(validate_password_strength("NoDigits!!").is_err()); // no digit
        assert!(validate_password_strength("NoSymbol99").is_err()); // no symbol
        assert!(validate_password_strength("Good-Pass1").is_ok());
    }
}
