//! Second-factor enrollment and management handlers

use axum::extract::{Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::{accounts, email_otp, AuthAccount};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Serialize)]
pub struct TotpSetupResponse {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_png_base64: String,
    pub backup_codes: Vec<String>,
}

#[derive(Deserialize)]
pub struct TotpConfirmRequest {
    pub code: String,
}

#[derive(Deserialize)]
pub struct DisableRequest {
    pub password: String,
}

#[derive(Deserialize)]
pub struct IssueOtpRequest {
    pub challenge_token: String,
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
// TOTP
// =============================================================================

/// POST /api/v1/auth/mfa/totp/setup
///
/// Returns the secret, otpauth URI, QR image and backup codes. The
/// plaintext codes appear here exactly once; TOTP stays pending until
/// the first code is confirmed.
pub async fn begin_totp_setup(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
) -> ApiResult<Json<TotpSetupResponse>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    if account.totp_enabled {
        return Err(ApiError::PolicyViolation(
            "TOTP is already enabled; disable it before re-enrolling".to_string(),
        ));
    }

    let setup = state.totp_manager.begin_setup(&account).await?;

    Ok(Json(TotpSetupResponse {
        secret: setup.secret,
        provisioning_uri: setup.provisioning_uri,
        qr_png_base64: setup.qr_png_base64,
        backup_codes: setup.backup_codes,
    }))
}

/// POST /api/v1/auth/mfa/totp/confirm
pub async fn confirm_totp_setup(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
    Json(payload): Json<TotpConfirmRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    state
        .totp_manager
        .confirm_setup(&account, payload.code.trim())
        .await?;

    tracing::info!(account_id = %account.id, "TOTP enrollment confirmed");
    Ok(message("TOTP enabled"))
}

/// POST /api/v1/auth/mfa/totp/disable
///
/// Re-confirms the password; the secret and backup codes are wiped.
pub async fn disable_totp(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
    Json(payload): Json<DisableRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    state
        .totp_manager
        .disable(&account, &payload.password)
        .await?;

    tracing::info!(account_id = %account.id, "TOTP disabled");
    Ok(message("TOTP disabled"))
}

// =============================================================================
// Email OTP
// =============================================================================

/// POST /api/v1/auth/mfa/email-otp/enable
pub async fn enable_email_otp(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
) -> ApiResult<Json<MessageResponse>> {
    email_otp::enable(&state.pool, auth.account_id).await?;
    Ok(message("Email codes enabled"))
}

/// POST /api/v1/auth/mfa/email-otp/disable
pub async fn disable_email_otp(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthAccount>,
    Json(payload): Json<DisableRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let account = accounts::find_by_id(&state.pool, auth.account_id).await?;
    email_otp::disable(&state.pool, &account, &payload.password).await?;
    Ok(message("Email codes disabled"))
}

/// POST /api/v1/auth/mfa/email-otp/issue
///
/// Public but gated by a pending MFA challenge token, so a caller can
/// request (or re-request) their emailed code mid sign-in. Rate-limited
/// per account to keep the mailbox quiet.
pub async fn issue_email_otp(
    State(state): State<AppState>,
    Json(payload): Json<IssueOtpRequest>,
) -> ApiResult<Json<MessageResponse>> {
    let claims = state
        .jwt_manager
        .verify_mfa_challenge(&payload.challenge_token)?;

    if state
        .rate_limiter
        .is_limited(
            "otp-issue",
            &claims.sub.to_string(),
            state.config.otp_issue_max_attempts,
            state.config.otp_issue_window_secs,
        )
        .await
    {
        return Err(ApiError::RateLimited);
    }

    let account = accounts::find_by_id(&state.pool, claims.sub).await?;
    let code = email_otp::issue(&state.token_manager, &account).await?;
    state.security_email.send_otp_code(&account.email, &code);

    Ok(message("A sign-in code is on its way"))
}
