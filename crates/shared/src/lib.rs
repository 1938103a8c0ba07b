// Shared crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Yozakura Shared
//!
//! Infrastructure pieces used by every service binary: database pool
//! construction, retry-with-backoff for transient store errors, and the
//! rate limiter with its in-process fallback. No business logic lives
//! here.

pub mod db;
pub mod rate_limit;

pub use db::{create_pool, is_transient, with_retry, MAX_RETRY_ATTEMPTS};
pub use rate_limit::RateLimiter;
