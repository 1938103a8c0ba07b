//! Request gate middleware
//!
//! Every inbound request on a gated route passes through here: the
//! session cookie (or bearer header) is verified cryptographically - no
//! store lookup - and the embedded identity is exposed to handlers as an
//! `AuthAccount` extension. Browser-facing paths get redirect semantics;
//! API paths get 401/403 JSON.

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use uuid::Uuid;

use super::accounts::ROLE_ADMIN;
use super::jwt::JwtManager;
use crate::error::ApiError;

/// Session cookie set by the sign-in handler
pub const SESSION_COOKIE: &str = "yozakura_session";

/// Authenticated identity extracted from a verified session token
#[derive(Debug, Clone)]
pub struct AuthAccount {
    pub account_id: Uuid,
    pub role: String,
}

impl AuthAccount {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// State needed for session verification
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: JwtManager,
}

/// Extract the session token from the session cookie
fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            for cookie in cookies.split(';') {
                let cookie = cookie.trim();
                if let Some(token) = cookie.strip_prefix(SESSION_COOKIE) {
                    if let Some(value) = token.strip_prefix('=') {
                        return Some(value.to_string());
                    }
                }
            }
            None
        })
}

/// Extract the session token from the Authorization header or cookie.
/// Header wins so API clients can override a stale browser cookie.
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Extract the client IP for rate-limit keys (X-Forwarded-For first IP,
/// then X-Real-IP, then unknown)
pub fn extract_client_ip(request: &Request) -> String {
    if let Some(xff) = request.headers().get("X-Forwarded-For") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first) = xff_str.split(',').next() {
                return first.trim().to_string();
            }
        }
    }
    if let Some(real_ip) = request.headers().get("X-Real-IP") {
        if let Ok(ip) = real_ip.to_str() {
            return ip.to_string();
        }
    }
    "unknown".to_string()
}

/// Middleware that requires a valid session
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(&request) else {
        return ApiError::Unauthenticated.into_response();
    };

    match auth_state.jwt_manager.verify_session(&token) {
        Ok(claims) => {
            request.extensions_mut().insert(AuthAccount {
                account_id: claims.sub,
                role: claims.role,
            });
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(path = %request.uri().path(), error = %err, "Session verification failed");
            err.into_response()
        }
    }
}

/// Middleware that requires a valid session AND the admin role.
/// Downstream subsystems (blog, analytics, catalog) gate their admin
/// surfaces with this; they never touch tokens or MFA state directly.
pub async fn require_admin(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer_token(&request) else {
        return ApiError::Unauthenticated.into_response();
    };

    match auth_state.jwt_manager.verify_session(&token) {
        Ok(claims) => {
            if claims.role != ROLE_ADMIN {
                return ApiError::Forbidden.into_response();
            }
            request.extensions_mut().insert(AuthAccount {
                account_id: claims.sub,
                role: claims.role,
            });
            next.run(request).await
        }
        Err(err) => err.into_response(),
    }
}

/// Browser-path gate: unauthenticated visitors are redirected away from
/// protected paths, authenticated ones away from auth paths. Everything
/// else passes through untouched.
pub async fn route_gate(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();

    let authenticated = extract_bearer_token(&request)
        .map(|token| auth_state.jwt_manager.verify_session(&token).is_ok())
        .unwrap_or(false);

    if is_protected_path(path) && !authenticated {
        return Redirect::to("/signin").into_response();
    }
    if is_auth_path(path) && authenticated {
        return Redirect::to("/").into_response();
    }

    next.run(request).await
}

/// Paths that require a session before rendering
fn is_protected_path(path: &str) -> bool {
    path.starts_with("/dashboard")
        || path.starts_with("/settings")
        || path.starts_with("/admin")
        || path.starts_with("/posts/new")
        || path.starts_with("/posts/edit")
}

/// Paths a signed-in visitor has no business on
fn is_auth_path(path: &str) -> bool {
    path == "/signin" || path == "/signup" || path.starts_with("/reset-password")
}
