//! Route table
//!
//! The auth core's HTTP surface. Everything else the product serves
//! (blog, catalog, dashboards) mounts next to this and protects itself
//! with `require_auth` / `require_admin`; none of it touches tokens or
//! MFA state directly.

pub mod auth;
pub mod mfa;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::{require_auth, route_gate};
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // No session required; these establish or recover one
    let public = Router::new()
        .route("/signup", post(auth::signup))
        .route("/signin", post(auth::signin))
        .route("/mfa/verify", post(auth::verify_mfa))
        .route("/mfa/email-otp/issue", post(mfa::issue_email_otp))
        .route("/password-reset/request", post(auth::request_password_reset))
        .route("/password-reset/confirm", post(auth::confirm_password_reset))
        .route("/verify-email/confirm", post(auth::confirm_email_verification));

    let protected = Router::new()
        .route("/me", get(auth::me))
        .route("/signout", post(auth::signout))
        .route("/password", put(auth::change_password))
        .route("/email", put(auth::change_email))
        .route("/verify-email/request", post(auth::request_email_verification))
        .route("/mfa/totp/setup", post(mfa::begin_totp_setup))
        .route("/mfa/totp/confirm", post(mfa::confirm_totp_setup))
        .route("/mfa/totp/disable", post(mfa::disable_totp))
        .route("/mfa/email-otp/enable", post(mfa::enable_email_otp))
        .route("/mfa/email-otp/disable", post(mfa::disable_email_otp))
        .route_layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/auth", public.merge(protected))
        .layer(middleware::from_fn_with_state(auth_state, route_gate))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
