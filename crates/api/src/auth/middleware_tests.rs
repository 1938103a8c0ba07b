//! Unit tests for the request gate middleware
//!
//! Tests cover:
//! - Session verification (bearer header, cookie, precedence)
//! - Token-type confusion (challenge tokens are not sessions)
//! - Role-based access control
//! - Browser redirect semantics
//! - Client IP extraction

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{header, Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tower::ServiceExt;
use uuid::Uuid;

use super::jwt::JwtManager;
use super::middleware::{
    extract_client_ip, require_admin, require_auth, route_gate, AuthAccount, AuthState,
    SESSION_COOKIE,
};
use crate::auth::{ROLE_ADMIN, ROLE_DEFAULT};

const TEST_SECRET: &str = "test-jwt-secret-key-for-testing-only";

fn test_auth_state() -> AuthState {
    AuthState {
        jwt_manager: JwtManager::new(TEST_SECRET, 24),
    }
}

async fn whoami(Extension(auth): Extension<AuthAccount>) -> String {
    format!("{}:{}", auth.account_id, auth.is_admin())
}

/// Router with one session-gated route and one admin-gated route
fn gated_app(auth_state: AuthState) -> Router {
    Router::new()
        .route(
            "/protected",
            get(whoami).route_layer(from_fn_with_state(auth_state.clone(), require_auth)),
        )
        .route(
            "/admin",
            get(whoami).route_layer(from_fn_with_state(auth_state, require_admin)),
        )
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .body(Body::empty())
        .expect("request")
}

fn bearer_request(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn missing_token_is_unauthenticated() {
    let app = gated_app(test_auth_state());
    let response = app.oneshot(get_request("/protected")).await.expect("serve");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn valid_bearer_session_reaches_handler() {
    let auth_state = test_auth_state();
    let account_id = Uuid::new_v4();
    let token = auth_state
        .jwt_manager
        .issue_session(account_id, ROLE_DEFAULT)
        .expect("issue");

    let app = gated_app(auth_state);
    let response = app
        .oneshot(bearer_request("/protected", &token))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body, format!("{account_id}:false").as_bytes());
}

#[tokio::test]
async fn session_cookie_reaches_handler() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let request = Request::builder()
        .uri("/protected")
        .header(
            header::COOKIE,
            format!("theme=dark; {SESSION_COOKIE}={token}; lang=en"),
        )
        .body(Body::empty())
        .expect("request");

    let response = gated_app(auth_state)
        .oneshot(request)
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bearer_header_wins_over_stale_cookie() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let request = Request::builder()
        .uri("/protected")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::COOKIE, format!("{SESSION_COOKIE}=not-a-jwt"))
        .body(Body::empty())
        .expect("request");

    let response = gated_app(auth_state)
        .oneshot(request)
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn garbage_token_is_unauthenticated() {
    let app = gated_app(test_auth_state());
    let response = app
        .oneshot(bearer_request("/protected", "not-a-jwt"))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mfa_challenge_token_is_not_a_session() {
    let auth_state = test_auth_state();
    let challenge = auth_state
        .jwt_manager
        .issue_mfa_challenge(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let app = gated_app(auth_state);
    let response = app
        .oneshot(bearer_request("/protected", &challenge))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn default_role_is_forbidden_on_admin_routes() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let app = gated_app(auth_state);
    let response = app
        .oneshot(bearer_request("/admin", &token))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_role_passes_admin_routes() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_ADMIN)
        .expect("issue");

    let app = gated_app(auth_state);
    let response = app
        .oneshot(bearer_request("/admin", &token))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Browser redirect gate
// =============================================================================

async fn ok_handler() -> &'static str {
    "ok"
}

fn gate_app(auth_state: AuthState) -> Router {
    Router::new()
        .route("/", get(ok_handler))
        .route("/dashboard", get(ok_handler))
        .route("/signin", get(ok_handler))
        .layer(from_fn_with_state(auth_state, route_gate))
}

fn location(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
}

#[tokio::test]
async fn anonymous_visitor_is_redirected_off_protected_paths() {
    let app = gate_app(test_auth_state());
    let response = app.oneshot(get_request("/dashboard")).await.expect("serve");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/signin");
}

#[tokio::test]
async fn signed_in_visitor_is_redirected_off_auth_paths() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let app = gate_app(auth_state);
    let response = app
        .oneshot(bearer_request("/signin", &token))
        .await
        .expect("serve");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn public_paths_pass_through_either_way() {
    let auth_state = test_auth_state();
    let token = auth_state
        .jwt_manager
        .issue_session(Uuid::new_v4(), ROLE_DEFAULT)
        .expect("issue");

    let app = gate_app(auth_state);
    let anonymous = app
        .clone()
        .oneshot(get_request("/"))
        .await
        .expect("serve");
    assert_eq!(anonymous.status(), StatusCode::OK);

    let signed_in = app
        .oneshot(bearer_request("/", &token))
        .await
        .expect("serve");
    assert_eq!(signed_in.status(), StatusCode::OK);
}

// =============================================================================
// Client IP extraction
// =============================================================================

#[test]
fn client_ip_prefers_first_forwarded_hop() {
    let request = Request::builder()
        .uri("/")
        .header("X-Forwarded-For", "203.0.113.7, 10.0.0.1")
        .header("X-Real-IP", "10.0.0.1")
        .body(Body::empty())
        .expect("request");
    assert_eq!(extract_client_ip(&request), "203.0.113.7");
}

#[test]
fn client_ip_falls_back_to_real_ip_then_unknown() {
    let request = Request::builder()
        .uri("/")
        .header("X-Real-IP", "198.51.100.4")
        .body(Body::empty())
        .expect("request");
    assert_eq!(extract_client_ip(&request), "198.51.100.4");

    let bare = Request::builder()
        .uri("/")
        .body(Body::empty())
        .expect("request");
    assert_eq!(extract_client_ip(&bare), "unknown");
}
