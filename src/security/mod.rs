//! Security middleware.
//!
//! - [`VerifyCsrfToken`] — double-submit cookie CSRF verification with token
//!   rotation on every passing request.
//! - [`PathPattern`] — exact-or-wildcard path matching used for exclusion
//!   lists and [`Request::is`](crate::Request::is).

pub mod csrf;
pub mod pattern;

pub use csrf::VerifyCsrfToken;
pub use pattern::PathPattern;
