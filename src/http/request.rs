//! The backend-agnostic request model.
//!
//! Backends build a [`Request`] through [`RequestBuilder`]; once built, its
//! method, target, headers, query, cookies, parsed body, and server metadata
//! never change. The attribute map is the single extension point, and
//! [`Request::with_attribute`] returns a new request instead of mutating the
//! one other stages may still hold.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::{Map, Value};

use super::body::{BodyStream, CHUNK_SIZE};
use super::cookie::parse_cookie_header;
use super::{Headers, HttpError, Method, Version};
use crate::context::{Attributes, Session};
use crate::security::PathPattern;

/// Where a request came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Short name of the backend that accepted the connection.
    pub backend: &'static str,
}

/// A fully normalized, immutable HTTP request.
///
/// Cloning is cheap: the head is shared behind an [`Arc`] and the body handle
/// is shared by every clone, so the raw body stream can still only be read
/// once.
///
/// # Examples
///
/// ```
/// use tandem::http::{Method, Request};
///
/// let request = Request::builder()
///     .method(Method::Post)
///     .target("/login?next=%2Fhome")
///     .header("content-type", "application/x-www-form-urlencoded")
///     .header("cookie", "theme=dark")
///     .body("user=alice&_token=abc")
///     .build();
///
/// assert_eq!(request.path(), "/login");
/// assert_eq!(request.query("next"), Some("/home"));
/// assert_eq!(request.cookie("theme"), Some("dark"));
/// assert_eq!(request.post("_token").and_then(|v| v.as_str()), Some("abc"));
/// assert_eq!(request.headers().iter().next().unwrap().0, "Content-Type");
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    head: Arc<Head>,
    body: RequestBody,
    attributes: Attributes,
}

#[derive(Debug)]
struct Head {
    method: Method,
    target: String,
    path: String,
    query_string: Option<String>,
    version: Version,
    headers: Headers,
    query: HashMap<String, String>,
    parsed_body: Option<Map<String, Value>>,
    cookies: HashMap<String, String>,
    server: HashMap<String, String>,
    connection: ConnectionInfo,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Returns `true` if the method matches `method` (case-insensitive).
    pub fn is_method(&self, method: &str) -> bool {
        self.head.method.as_str().eq_ignore_ascii_case(method)
    }

    /// Returns the request target exactly as received (path and query).
    pub fn uri(&self) -> &str {
        &self.head.target
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.head.path
    }

    /// Returns `true` if the path matches `pattern` (exact, or `*` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        PathPattern::parse(pattern).matches(self.path())
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.head.query_string.as_deref()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    /// Returns the first value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.headers.get(name)
    }

    /// Returns every value of the named header joined by `", "`, or `""`.
    pub fn header_line(&self, name: &str) -> String {
        self.head.headers.get_line(name)
    }

    /// Returns the decoded query parameters.
    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.head.query
    }

    /// Returns a decoded query parameter value by key.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.head.query.get(key).map(String::as_str)
    }

    /// Returns the parsed body for form and JSON requests.
    pub fn parsed_body(&self) -> Option<&Map<String, Value>> {
        self.head.parsed_body.as_ref()
    }

    /// Returns a field of the parsed body.
    pub fn post(&self, key: &str) -> Option<&Value> {
        self.head.parsed_body.as_ref()?.get(key)
    }

    /// Returns `key` from the query string, else from the parsed body.
    ///
    /// Missing keys and empty strings are both treated as absent.
    pub fn input(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.query(key).filter(|v| !v.is_empty()) {
            return Some(Value::from(value));
        }
        self.post(key)
            .filter(|v| v.as_str() != Some(""))
            .cloned()
    }

    /// Looks up several keys at once with the same rules as [`input`](Self::input).
    pub fn input_many(&self, keys: &[&str]) -> HashMap<String, Option<Value>> {
        keys.iter()
            .map(|key| ((*key).to_owned(), self.input(key)))
            .collect()
    }

    /// Query parameters merged over the parsed body; the query wins on collisions.
    pub fn all(&self) -> Map<String, Value> {
        let mut all = self.head.parsed_body.clone().unwrap_or_default();
        for (key, value) in &self.head.query {
            all.insert(key.clone(), Value::from(value.as_str()));
        }
        all
    }

    /// Returns the request cookies.
    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.head.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.head.cookies.get(name).map(String::as_str)
    }

    /// Returns the server/connection metadata map (upper-case keys).
    pub fn server_params(&self) -> &HashMap<String, String> {
        &self.head.server
    }

    /// Looks up a server parameter; the name is upper-cased first.
    pub fn server(&self, name: &str) -> Option<&str> {
        self.head
            .server
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.head.connection
    }

    /// Returns the raw body handle.
    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Reads the whole raw body.
    ///
    /// # Errors
    ///
    /// [`HttpError::BodyConsumed`] if a streamed body was already taken, or
    /// [`HttpError::Body`] if reading from the connection failed.
    pub async fn raw(&self) -> Result<Bytes, HttpError> {
        self.body.bytes().await
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.attributes.get::<T>()
    }

    /// Returns a new request carrying `value` as an attribute.
    ///
    /// The head and body are shared with `self`; `self` is left unchanged.
    #[must_use]
    pub fn with_attribute<T>(&self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            head: Arc::clone(&self.head),
            body: self.body.clone(),
            attributes: self.attributes.with(value),
        }
    }

    /// Returns the session attached by an upstream session stage.
    ///
    /// # Errors
    ///
    /// [`HttpError::SessionNotStarted`] if no session is attached. The route
    /// was reachable without the session middleware, which is a wiring bug.
    pub fn session(&self) -> Result<&Session, HttpError> {
        self.attributes
            .get::<Session>()
            .ok_or(HttpError::SessionNotStarted)
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.head.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.head.version == Version::Http11,
        }
    }

    /// Returns the value of the `Content-Length` header parsed as a `u64`, if present.
    pub fn content_length(&self) -> Option<u64> {
        self.head.headers.get("content-length")?.trim().parse().ok()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.head.method, self.head.target)
    }
}

#[derive(Debug)]
enum BodyState {
    Empty,
    Full(Bytes),
    Stream(BodyStream),
    Consumed,
}

/// Shared handle to a request body.
///
/// Buffered bodies can be read any number of times. A streamed body is
/// handed out once; later reads fail with [`HttpError::BodyConsumed`].
#[derive(Debug, Clone)]
pub struct RequestBody {
    state: Arc<Mutex<BodyState>>,
}

impl RequestBody {
    fn new(state: BodyState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Returns `true` when the body is held in memory.
    pub fn is_buffered(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            BodyState::Empty | BodyState::Full(_)
        )
    }

    /// Returns the buffered body without waiting, if it is buffered.
    pub fn buffered(&self) -> Option<Bytes> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            BodyState::Empty => Some(Bytes::new()),
            BodyState::Full(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Takes the body as a chunk stream.
    ///
    /// # Errors
    ///
    /// [`HttpError::BodyConsumed`] if the stream was already taken.
    pub fn take_stream(&self) -> Result<BodyStream, HttpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, BodyState::Stream(_)) {
            if let BodyState::Stream(stream) = std::mem::replace(&mut *state, BodyState::Consumed) {
                return Ok(stream);
            }
        }
        match &*state {
            BodyState::Empty => Ok(BodyStream::buffered(Bytes::new(), CHUNK_SIZE)),
            BodyState::Full(bytes) => Ok(BodyStream::buffered(bytes.clone(), CHUNK_SIZE)),
            BodyState::Stream(_) | BodyState::Consumed => Err(HttpError::BodyConsumed),
        }
    }

    /// Reads the whole body into memory.
    pub async fn bytes(&self) -> Result<Bytes, HttpError> {
        let stream = self.take_stream()?;
        Ok(stream.collect().await?)
    }
}

/// Builder used by backend adapters (and tests) to assemble a [`Request`].
///
/// Unless overridden, [`build`](Self::build) derives the query map from the
/// target, the cookie map from the `Cookie` header, the parsed body from a
/// buffered form or JSON body, and the standard server parameters.
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    target: String,
    version: Version,
    headers: Headers,
    server: HashMap<String, String>,
    connection: ConnectionInfo,
    body: BodyState,
    query: Option<HashMap<String, String>>,
    cookies: Option<HashMap<String, String>>,
    parsed_body: Option<Map<String, Value>>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: Method::Get,
            target: "/".to_owned(),
            version: Version::Http11,
            headers: Headers::new(),
            server: HashMap::new(),
            connection: ConnectionInfo::default(),
            body: BodyState::Empty,
            query: None,
            cookies: None,
            parsed_body: None,
        }
    }

    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets the request target (`/path?query`).
    #[must_use]
    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    #[must_use]
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Appends a header; the name is canonicalized.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a server parameter; the name is upper-cased.
    #[must_use]
    pub fn server_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.server.insert(name.to_ascii_uppercase(), value.into());
        self
    }

    #[must_use]
    pub fn connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = connection;
        self
    }

    /// Sets a buffered body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.body = if body.is_empty() {
            BodyState::Empty
        } else {
            BodyState::Full(body)
        };
        self
    }

    /// Sets a streamed body. Streamed bodies are never parsed.
    #[must_use]
    pub fn body_stream(mut self, stream: BodyStream) -> Self {
        self.body = BodyState::Stream(stream);
        self
    }

    /// Supplies an already decoded query map instead of parsing the target.
    #[must_use]
    pub fn query_params(mut self, query: HashMap<String, String>) -> Self {
        self.query = Some(query);
        self
    }

    /// Supplies an already parsed cookie map instead of reading the header.
    #[must_use]
    pub fn cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Supplies an already parsed body instead of decoding it here.
    #[must_use]
    pub fn parsed_body(mut self, body: Map<String, Value>) -> Self {
        self.parsed_body = Some(body);
        self
    }

    pub fn build(self) -> Request {
        let (path, query_string) = match self.target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (self.target.clone(), None),
        };

        let query = self.query.unwrap_or_else(|| {
            query_string
                .as_deref()
                .map(parse_urlencoded)
                .unwrap_or_default()
        });

        let cookies = self.cookies.unwrap_or_else(|| {
            let line = self.headers.get_all("cookie").collect::<Vec<_>>().join("; ");
            parse_cookie_header(&line)
        });

        let parsed_body = self.parsed_body.or_else(|| match &self.body {
            BodyState::Full(bytes) => parse_body(self.headers.get("content-type"), bytes),
            _ => None,
        });

        let mut server = self.server;
        let defaults = [
            ("REQUEST_METHOD", self.method.as_str().to_owned()),
            ("REQUEST_URI", self.target.clone()),
            ("PATH_INFO", path.clone()),
            ("QUERY_STRING", query_string.clone().unwrap_or_default()),
            ("SERVER_PROTOCOL", self.version.as_str().to_owned()),
            ("REQUEST_TIME", unix_time().to_string()),
        ];
        for (key, value) in defaults {
            server.entry(key.to_owned()).or_insert(value);
        }
        if let Some(addr) = self.connection.remote_addr {
            server.entry("REMOTE_ADDR".to_owned()).or_insert(addr.ip().to_string());
            server.entry("REMOTE_PORT".to_owned()).or_insert(addr.port().to_string());
        }
        if let Some(addr) = self.connection.local_addr {
            server.entry("SERVER_ADDR".to_owned()).or_insert(addr.ip().to_string());
            server.entry("SERVER_PORT".to_owned()).or_insert(addr.port().to_string());
        }

        Request {
            head: Arc::new(Head {
                method: self.method,
                target: self.target,
                path,
                query_string,
                version: self.version,
                headers: self.headers,
                query,
                parsed_body,
                cookies,
                server,
                connection: self.connection,
            }),
            body: RequestBody::new(self.body),
            attributes: Attributes::new(),
        }
    }
}

/// Decodes `a=1&b=two+words` into a map; later duplicates win.
pub fn parse_urlencoded(input: &str) -> HashMap<String, String> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(input)
        .map(|pairs| pairs.into_iter().collect())
        .unwrap_or_default()
}

// Form and JSON-object bodies are parsed; anything else stays raw.
fn parse_body(content_type: Option<&str>, body: &Bytes) -> Option<Map<String, Value>> {
    let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "application/x-www-form-urlencoded" => {
            let pairs = serde_urlencoded::from_bytes::<Vec<(String, String)>>(body).ok()?;
            Some(
                pairs
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            )
        }
        "application/json" => match serde_json::from_slice::<Value>(body).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
