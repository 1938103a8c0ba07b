//! Session authority
//!
//! Sessions are stateless signed bearer tokens: validity is cryptographic,
//! never store-backed, so `verify_session` performs no database lookup.
//! The server never revokes a session early; the expiry window is the only
//! bound. A second, short-lived token type carries the "awaiting second
//! factor" state between credential verification and session issuance and
//! is never accepted as a session.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// MFA challenge tokens live just long enough to type a code
const MFA_CHALLENGE_EXPIRY_MINUTES: i64 = 5;

/// What a signed token is allowed to prove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Full authenticated session
    Session,
    /// Credentials verified, second factor still outstanding
    Mfa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id
    pub sub: Uuid,
    /// Account role, for downstream authorization checks
    pub role: String,
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// Issues and verifies signed session and MFA-challenge tokens (HS256)
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    session_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, session_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            session_expiry_hours,
        }
    }

    /// Mint a session token. Callers only reach this after credential
    /// verification and, where enabled, a completed MFA challenge.
    pub fn issue_session(&self, account_id: Uuid, role: &str) -> ApiResult<String> {
        self.issue(
            account_id,
            role,
            TokenType::Session,
            Duration::hours(self.session_expiry_hours),
        )
    }

    /// Mint a short-lived challenge token proving the first factor passed
    pub fn issue_mfa_challenge(&self, account_id: Uuid, role: &str) -> ApiResult<String> {
        self.issue(
            account_id,
            role,
            TokenType::Mfa,
            Duration::minutes(MFA_CHALLENGE_EXPIRY_MINUTES),
        )
    }

    fn issue(
        &self,
        account_id: Uuid,
        role: &str,
        token_type: TokenType,
        ttl: Duration,
    ) -> ApiResult<String> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: account_id,
            role: role.to_string(),
            token_type,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::internal(format!("Token signing failed: {e}")))
    }

    /// Signature and expiry check only - no store lookup.
    ///
    /// Bad signature (or an MFA challenge presented as a session) is
    /// `Unauthenticated`; a lapsed expiry is `SessionExpired`.
    pub fn verify_session(&self, token: &str) -> ApiResult<Claims> {
        let claims = self.decode(token, ApiError::SessionExpired)?;
        if claims.token_type != TokenType::Session {
            return Err(ApiError::Unauthenticated);
        }
        Ok(claims)
    }

    /// Verify a pending-MFA challenge token. Expired challenges are
    /// indistinguishable from invalid ones - the client restarts sign-in.
    pub fn verify_mfa_challenge(&self, token: &str) -> ApiResult<Claims> {
        let claims = self.decode(token, ApiError::Unauthenticated)?;
        if claims.token_type != TokenType::Mfa {
            return Err(ApiError::Unauthenticated);
        }
        Ok(claims)
    }

    fn decode(&self, token: &str, expired_error: ApiError) -> ApiResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => expired_error,
                _ => ApiError::Unauthenticated,
            })
    }
}
