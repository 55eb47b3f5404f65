//! Cookie codec — `Set-Cookie` serialization and parsing, `Cookie` header parsing.
//!
//! The wire format is
//!
//! ```text
//! Name=Value; Expires=<IMF-fixdate>; Path=<p>; Domain=<d>; Secure; HttpOnly; SameSite=<policy>
//! ```
//!
//! with each attribute written only when it is set.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use time::{OffsetDateTime, PrimitiveDateTime, macros::format_description};

/// Errors produced while parsing a `Set-Cookie` line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("cookie has no name")]
    MissingName,

    #[error("invalid Expires attribute: {0}")]
    InvalidExpires(String),

    #[error("invalid Max-Age attribute: {0}")]
    InvalidMaxAge(String),

    #[error("invalid SameSite attribute: {0}")]
    InvalidSameSite(String),
}

/// The `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax => "Lax",
            Self::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = CookieError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("strict") {
            Ok(Self::Strict)
        } else if s.eq_ignore_ascii_case("lax") {
            Ok(Self::Lax)
        } else if s.eq_ignore_ascii_case("none") {
            Ok(Self::None)
        } else {
            Err(CookieError::InvalidSameSite(s.to_owned()))
        }
    }
}

/// A single response cookie.
///
/// Built with [`Cookie::new`] and the chained attribute setters, then attached
/// to a [`Response`](super::Response) with
/// [`with_cookie`](super::Response::with_cookie). [`fmt::Display`] renders the
/// `Set-Cookie` header value.
///
/// # Examples
///
/// ```
/// use tandem::http::{Cookie, SameSite};
///
/// let cookie = Cookie::new("theme", "dark")
///     .path("/")
///     .http_only(true)
///     .same_site(SameSite::Lax);
///
/// assert_eq!(cookie.to_string(), "theme=dark; Path=/; HttpOnly; SameSite=Lax");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    expires: Option<OffsetDateTime>,
    path: Option<String>,
    domain: Option<String>,
    secure: bool,
    http_only: bool,
    same_site: Option<SameSite>,
}

impl Cookie {
    /// Creates a session cookie with no attributes.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            path: None,
            domain: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// Sets an absolute expiry time.
    #[must_use]
    pub fn expires(mut self, at: OffsetDateTime) -> Self {
        self.expires = Some(at);
        self
    }

    /// Sets the expiry to `ttl` from now.
    #[must_use]
    pub fn expires_in(self, ttl: Duration) -> Self {
        self.expires(OffsetDateTime::now_utc() + ttl)
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[must_use]
    pub fn same_site(mut self, policy: SameSite) -> Self {
        self.same_site = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires
    }

    pub fn path_attr(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn domain_attr(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    pub fn same_site_attr(&self) -> Option<SameSite> {
        self.same_site
    }

    /// Returns `true` when `other` addresses the same browser slot, i.e. shares
    /// name, path, and domain. A later cookie with the same slot replaces the
    /// earlier one.
    pub fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.path == other.path && self.domain == other.domain
    }

    /// Parses a `Set-Cookie` header value.
    ///
    /// `Max-Age` is converted into an absolute expiry relative to now. Unknown
    /// attributes are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`CookieError`] when the name is missing or an attribute value
    /// cannot be interpreted.
    pub fn parse(line: &str) -> Result<Self, CookieError> {
        let mut parts = line.split(';');
        let pair = parts.next().unwrap_or_default();
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = name.trim();
        if name.is_empty() {
            return Err(CookieError::MissingName);
        }
        let mut cookie = Cookie::new(name, value.trim());

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            if key.eq_ignore_ascii_case("expires") {
                cookie.expires = Some(parse_http_date(val)?);
            } else if key.eq_ignore_ascii_case("max-age") {
                let secs: i64 = val
                    .parse()
                    .map_err(|_| CookieError::InvalidMaxAge(val.to_owned()))?;
                cookie.expires =
                    Some(OffsetDateTime::now_utc() + time::Duration::seconds(secs));
            } else if key.eq_ignore_ascii_case("path") {
                cookie.path = Some(val.to_owned());
            } else if key.eq_ignore_ascii_case("domain") {
                cookie.domain = Some(val.to_owned());
            } else if key.eq_ignore_ascii_case("secure") {
                cookie.secure = true;
            } else if key.eq_ignore_ascii_case("httponly") {
                cookie.http_only = true;
            } else if key.eq_ignore_ascii_case("samesite") {
                cookie.same_site = Some(val.parse()?);
            }
        }

        Ok(cookie)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(at) = self.expires {
            write!(f, "; Expires={}", format_http_date(at).map_err(|_| fmt::Error)?)?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if let Some(policy) = self.same_site {
            write!(f, "; SameSite={}", policy.as_str())?;
        }
        Ok(())
    }
}

/// Parses a request `Cookie` header (`a=1; b=2`) into a name → value map.
///
/// The first occurrence of a name wins. Surrounding double quotes are stripped
/// from values; pairs without a name are skipped.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        cookies
            .entry(name.to_owned())
            .or_insert_with(|| value.to_owned());
    }
    cookies
}

/// Formats a timestamp as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.to_offset(time::UtcOffset::UTC).format(format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    ))
}

fn parse_http_date(value: &str) -> Result<OffsetDateTime, CookieError> {
    PrimitiveDateTime::parse(
        value,
        format_description!(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
        ),
    )
    .map(PrimitiveDateTime::assume_utc)
    .map_err(|_| CookieError::InvalidExpires(value.to_owned()))
}
