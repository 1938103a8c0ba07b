//! Credential & multi-factor session security core

pub mod accounts;
pub mod email_otp;
pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;
pub mod password;
#[cfg(test)]
mod token_lifecycle_tests;
pub mod tokens;
pub mod totp;

pub use accounts::{normalize_email, Account, ROLE_ADMIN, ROLE_DEFAULT};
pub use jwt::{Claims, JwtManager, TokenType};
pub use middleware::{
    extract_client_ip, require_admin, require_auth, route_gate, AuthAccount, AuthState,
    SESSION_COOKIE,
};
pub use password::{
    generate_impossible_hash, hash_password, validate_password_strength, verify_password,
};
pub use tokens::{TokenManager, TokenPurpose, ValidatedToken};
pub use totp::{TotpManager, TotpSetup};
