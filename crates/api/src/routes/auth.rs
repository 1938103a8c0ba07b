//! Sign-up, sign-in, session and credential-recovery handlers

use axum::extract::{Extension, Request, State};
use axum::http::header::{HeaderValue, SET_COOKIE};
use axum::response::{IntoResponse, Response};
use axum::{Json, RequestExt};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use crate::auth::{accounts, email_otp, extract_client_ip, AuthAccount, SESSION_COOKIE};
use crate::auth::{normalize_email, TokenPurpose};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub display_name: Option<String>,
}

#[derive(Deserialize)]
pub struct SigninRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum SigninResponse {
    /// Credentials verified, second factor outstanding
    MfaRequired {
        mfa_required: bool,
        challenge_token: String,
        methods: Vec<&'static str>,
    },
    /// Fully authenticated
    Session { token: String, account: AccountInfo },
}

#[derive(Deserialize)]
pub struct MfaVerifyRequest {
    pub challenge_token: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct AccountInfo {
    pub id: uuid::Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: String,
    pub email_verified: bool,
    pub totp_enabled: bool,
    pub email_otp_enabled: bool,
    pub created_at: String,
}

impl AccountInfo {
    fn from_account(account: &accounts::Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            display_name: account.display_name.clone(),
            role: account.role.clone(),
            email_verified: account.email_verified,
            totp_enabled: account.totp_enabled,
            email_otp_enabled: account.email_otp_enabled,
            created_at: account
                .created_at
                .format(&Rfc3339)
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ChangeEmailRequest {
    pub password: String,
    pub new_email: String,
}

#[derive(Deserialize)]
pub struct ResetRequestRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetConfirmRequest {
    pub token: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct VerifyEmailConfirmRequest {
    pub token: String,
}

#[derive(Serialize)]
pub struct MessageResponse {
    pub message: String,
}

fn message(text: &str) -> Json<MessageResponse> {
    Json(MessageResponse {
        message: text.to_string(),
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/v1/auth/signup
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> ApiResult<Response> {
    let account = accounts::create_account(
        &state.pool,
        &payload.email,
        &payload.password,
        payload.display_name.as_deref(),
    )
    .await?;

    // New addresses start unverified; kick off the verification flow
    let token = state
        .token_manager
        .issue(account.id, TokenPurpose::EmailVerification)
        .await?;
    state
        .security_email
        .send_email_verification(&account.email, &token);

    let session = state
        .jwt_manager
        .issue_session(account.id, &account.role)?;
    session_response(&state, session, &account)
}

/// POST /api/v1/auth/signin
///
/// Rate-limited per email and per client IP. Accounts with a second
/// factor enabled get a short-lived challenge token instead of a
/// session.
pub async fn signin(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Response> {
    let ip = extract_client_ip(&request);
    let Json(payload): Json<SigninRequest> = request
        .extract()
        .await
        .map_err(|_| ApiError::PolicyViolation("malformed request body".to_string()))?;

    let email_key = normalize_email(&payload.email);
    let limited_by_email = state
        .rate_limiter
        .is_limited(
            "signin",
            &email_key,
            state.config.signin_max_attempts,
            state.config.signin_window_secs,
        )
        .await;
    let limited_by_ip = state
        .rate_limiter
        .is_limited(
            "signin-ip",
            &ip,
            state.config.signin_max_attempts * 4,
            state.config.signin_window_secs,
        )
        .await;
    if limited_by_email || limited_by_ip {
        return Err(ApiError::RateLimited);
    }

    let account =
        accounts::verify_credentials(&state.pool, &payload.email, &payload.password).await?;

    if account.mfa_enabled() {
        let challenge_token = state
            .jwt_manager
            .issue_mfa_challenge(account.id, &account.role)?;

        let mut methods = Vec::new();
        if account.totp_enabled {
            methods.push("totp");
        }
        if account.email_otp_enabled {
            methods.push("email_otp");

            // TOTP-less accounts get their code sent immediately
            if !account.totp_enabled {
                let code = email_otp::issue(&state.token_manager, &account).await?;
                state.security_email.send_otp_code(&account.email, &code);
            }
        }

        return Ok(Json(SigninResponse::MfaRequired {
            mfa_required: true,
            challenge_token,
            methods,
        })
        .into_response());
    }

    let session = state
        .jwt_manager
        .issue_session(account.id, &account.role)?;
    session_response(&state, session, &account)
}

/// POST /api/v1/auth/mfa/verify
///
/// Completes sign-in for MFA-enabled accounts: challenge token plus a
/// TOTP code, backup code or emailed one-time code.
pub async fn verify_mfa(
    State(state): State<AppState>,
    Json(payload): Json<MfaVerifyRequest>,
) -> ApiResult<Response> {
    let claims = state
        .jwt_manager
        .verify_mfa_challenge(&payload.challenge_token)?;

    if state
        .rate_limiter
        .is_limited(
            "mfa",
            &claims.sub.to_string(),
            state.config.mfa_max_attempts,
            state.config.mfa_window_secs,
        )
        .await
    {
        return Err(ApiError::RateLimited);
    }

    let account = accounts::find_by_id(&state.pool, claims.sub).await?;

    // A rejected code falls through to the next factor; anything else
    // (store down, corrupt secret) propagates verbatim.
    let mut verified = false;
    if account.totp_enabled {
        match state
            .totp_manager
            .verify_challenge(&account, &payload.code)
            .await
        {
            Ok(()) => verified = true,
            Err(e) if is_code_rejection(&e) => {}
            Err(e) => return Err(e),
        }
    }
    if !verified && account.email_otp_enabled {
        match email_otp::verify(&state.token_manager, account.id, &payload.code).await {
            Ok(()) => verified = true,
            Err(e) if is_code_rejection(&e) => {}
            Err(e) => return Err(e),
        }
    }
    if !verified {
        return Err(ApiError::InvalidCode);
    }

    let session = state
        .jwt_manager
        .issue_session(account.id, &account.role)?;
    session_response(&state, session, &account)
}

/// POST /api/v1/auth/signout
///
/// Sessions are stateless; sign-out is client-side removal. The server
/// just clears the cookie.
pub async fn signout() -> ApiResult<Response> {
    let mut response = message("Signed out").into_response();
    let clear = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    response.headers_mut().insert(
        SET_COOKIE,
        HeaderValue::from_str(&clear).map_err(|e| ApiError::internal(e.to_string()))?,
    );
    Ok(response)
}

/// GET /api/v1/auth/me
pub async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
) -> ApiResult<Json<AccountInfo>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    Ok(Json(AccountInfo::from_account(&account)))
}

/// PUT /api/v1/auth/password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
    Json(payload): Json<ChangePasswordRequest>,
) -> ApiResult<Json<MessageResponse>> {
    accounts::change_password(
        &state.pool,
        auth.account_id,
        &payload.current_password,
        &payload.new_password,
    )
    .await?;
    Ok(message("Password updated"))
}

/// PUT /api/v1/auth/email
///
/// Requires the current password; the new address starts unverified and
/// gets a fresh verification token.
pub async fn change_email(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
    Json(payload): Json<ChangeEmailRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let account = accounts::change_email(
        &state.pool,
        auth.account_id,
        &payload.password,
        &payload.new_email,
    )
    .await?;

    let token = state
        .token_manager
        .issue(account.id, TokenPurpose::EmailVerification)
        .await?;
    state
        .security_email
        .send_email_verification(&account.email, &token);

    Ok(message("Email updated; check your inbox to verify it"))
}

/// POST /api/v1/auth/password-reset/request
///
/// Always answers the same way - whether the account exists is never
/// revealed. Rate-limited per email and per IP.
pub async fn request_password_reset(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<Json<MessageResponse>> {
    let ip = extract_client_ip(&request);
    let Json(payload): Json<ResetRequestRequest> = request
        .extract()
        .await
        .map_err(|_| ApiError::PolicyViolation("malformed request body".to_string()))?;

    let email_key = normalize_email(&payload.email);
    let limited_by_email = state
        .rate_limiter
        .is_limited(
            "reset-request",
            &email_key,
            state.config.reset_request_max_attempts,
            state.config.reset_request_window_secs,
        )
        .await;
    let limited_by_ip = state
        .rate_limiter
        .is_limited(
            "reset-request-ip",
            &ip,
            state.config.reset_request_max_attempts * 4,
            state.config.reset_request_window_secs,
        )
        .await;
    if limited_by_email || limited_by_ip {
        return Err(ApiError::RateLimited);
    }

    if let Some(account) = accounts::find_by_email(&state.pool, &payload.email).await? {
        let token = state
            .token_manager
            .issue(account.id, TokenPurpose::PasswordReset)
            .await?;
        state
            .security_email
            .send_password_reset(&account.email, &token);
    }

    Ok(message(
        "If an account exists for that address, a reset link is on its way",
    ))
}

/// POST /api/v1/auth/password-reset/confirm
///
/// Ordering matters: the password mutation lands before the token's
/// consumed flag flips, so a crash in between leaves a retryable token
/// rather than an unreachable account.
pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<ResetConfirmRequest>,
) -> ApiResult<Json<MessageResponse>> {
    crate::auth::validate_password_strength(&payload.new_password)?;

    let token = state
        .token_manager
        .validate(&payload.token, TokenPurpose::PasswordReset)
        .await?;

    let password_hash = crate::auth::hash_password(&payload.new_password)?;
    accounts::update_password_hash(&state.pool, token.account_id, &password_hash).await?;

    state.token_manager.consume_validated(token.id).await?;

    tracing::info!(account_id = %token.account_id, "Password reset completed");
    Ok(message("Password updated, you can sign in now"))
}

/// POST /api/v1/auth/verify-email/request
pub async fn request_email_verification(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
) -> ApiResult<Json<MessageResponse>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    if account.email_verified {
        return Ok(message("Email is already verified"));
    }

    let token = state
        .token_manager
        .issue(account.id, TokenPurpose::EmailVerification)
        .await?;
    state
        .security_email
        .send_email_verification(&account.email, &token);

    Ok(message("Verification email sent"))
}

/// POST /api/v1/auth/verify-email/confirm
pub async fn confirm_email_verification(
    State(state): State<AppState>,
    Json(payload): Json<VerifyEmailConfirmRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let token = state
        .token_manager
        .validate(&payload.token, TokenPurpose::EmailVerification)
        .await?;

    // Mutate first, consume last (same reasoning as password reset)
    accounts::mark_email_verified(&state.pool, token.account_id).await?;
    state.token_manager.consume_validated(token.id).await?;

    Ok(message("Email verified"))
}

// =============================================================================
// Helpers
// =============================================================================

/// True for errors that mean "this code was wrong", which the MFA
/// challenge treats as a cue to try the next factor. Everything else is
/// a real failure and must not degrade into `InvalidCode`.
fn is_code_rejection(error: &ApiError) -> bool {
    matches!(
        error,
        ApiError::InvalidCode
            | ApiError::TokenNotFound
            | ApiError::TokenExpired
            | ApiError::TokenAlreadyUsed
    )
}

/// JSON session payload plus the HttpOnly session cookie
fn session_response(
    state: &AppState,
    session_token: String,
    account: &accounts::Account,
) -> ApiResult<Response> {
    let max_age_secs = state.config.session_expiry_hours * 3600;
    let cookie = format!(
        "{SESSION_COOKIE}={session_token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    );

    let mut response = Json(SigninResponse::Session {
        token: session_token,
        account: AccountInfo::from_account(account),
    })
    .into_response();

    response.headers_mut().insert(
        SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|e| ApiError::internal(e.to_string()))?,
    );
    Ok(response)
}
