use std::time::Duration;

use rand::{RngCore, rngs::OsRng};
use subtle::ConstantTimeEq;

use crate::{
    Method,
    http::{Cookie, HttpError, Request},
    middleware::{BoxFuture, Middleware, Next, Outcome},
};

use super::PathPattern;

/// Cookie that carries the issued token back to the client.
pub const TOKEN_COOKIE: &str = "X-XSRF-TOKEN";

/// Lifetime of an issued token cookie.
pub const TOKEN_TTL: Duration = Duration::from_secs(9 * 3600);

/// Length of a generated token before hex encoding.
const TOKEN_BYTES: usize = 32;

/// Double-submit cookie CSRF verification.
///
/// For every request whose method is in the checked set (by default only
/// `POST`) and whose path matches none of the exclusion patterns, the token
/// previously issued in the [`TOKEN_COOKIE`] cookie must equal the token the
/// client submits. The submitted token is read from, in order:
///
/// 1. the `X-CSRF-TOKEN` header,
/// 2. the `X-XSRF-TOKEN` header,
/// 3. the `_token` field of the parsed body.
///
/// The first non-empty value wins. A missing cookie, a missing submission, or
/// a mismatch fails with [`HttpError::TokenMismatch`] (status 419) and the
/// downstream stages never run.
///
/// Every request that passes gets a freshly generated token attached to the
/// outgoing response, so the token rotates on each successful request. This
/// includes safe methods and excluded paths, which is how clients obtain
/// their first token.
///
/// # Examples
///
/// ```rust
/// use tandem::security::VerifyCsrfToken;
///
/// let csrf = VerifyCsrfToken::new()
///     .except("/webhooks/*")
///     .except("/login");
/// ```
pub struct VerifyCsrfToken {
    except: Vec<PathPattern>,
    methods: Vec<Method>,
}

impl Default for VerifyCsrfToken {
    fn default() -> Self {
        Self::new()
    }
}

impl VerifyCsrfToken {
    /// Creates a stage that checks `POST` requests on every path.
    pub fn new() -> Self {
        Self {
            except: Vec::new(),
            methods: vec![Method::Post],
        }
    }

    /// Excludes paths matching `pattern` from the token check.
    ///
    /// Patterns are exact paths or contain `*` wildcards; they are tried in
    /// the order they were added.
    #[must_use]
    pub fn except(mut self, pattern: &str) -> Self {
        self.except.push(PathPattern::parse(pattern));
        self
    }

    /// Adds `method` to the set of methods that require a valid token.
    #[must_use]
    pub fn check_method(mut self, method: Method) -> Self {
        if !self.methods.contains(&method) {
            self.methods.push(method);
        }
        self
    }

    fn requires_check(&self, request: &Request) -> bool {
        self.methods.contains(request.method())
            && !self.except.iter().any(|p| p.matches(request.path()))
    }

    fn verify(&self, request: &Request) -> Result<(), HttpError> {
        let Some(expected) = request.cookie(TOKEN_COOKIE) else {
            tracing::debug!(path = request.path(), "csrf cookie missing");
            return Err(HttpError::TokenMismatch);
        };
        let Some(submitted) = submitted_token(request) else {
            tracing::debug!(path = request.path(), "csrf token not submitted");
            return Err(HttpError::TokenMismatch);
        };
        if bool::from(submitted.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            tracing::debug!(path = request.path(), "csrf token mismatch");
            Err(HttpError::TokenMismatch)
        }
    }
}

impl Middleware for VerifyCsrfToken {
    fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            if self.requires_check(&request) {
                if let Err(err) = self.verify(&request) {
                    return Err(err);
                }
            }

            let cookie = Cookie::new(TOKEN_COOKIE, generate_token())
                .expires_in(TOKEN_TTL)
                .path("/");
            next.run(request)
                .await
                .map(|response| response.with_cookie(cookie))
        })
    }

    fn name(&self) -> &'static str {
        "csrf"
    }
}

fn submitted_token(request: &Request) -> Option<String> {
    ["X-CSRF-TOKEN", "X-XSRF-TOKEN"]
        .iter()
        .find_map(|name| request.header(name).filter(|v| !v.is_empty()))
        .map(str::to_owned)
        .or_else(|| {
            request
                .post("_token")
                .and_then(|v| v.as_str())
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        })
}

/// 32 random bytes from the OS generator, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
