//! The immutable response model and its convenience factories.
//!
//! Every `with_*` method takes `&self` and returns a new [`Response`]; the
//! header and cookie lists are shared behind [`Arc`]s and copied only when a
//! new value actually changes them. A reference held by an earlier stage
//! therefore keeps observing exactly what it saw.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;

use super::body::{ByteRange, FileBody};
use super::{Cookie, Headers, HttpError, StatusCode};

/// The payload of a [`Response`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    #[default]
    Empty,
    /// An in-memory buffer.
    Full(Bytes),
    /// A file range streamed from disk at emission time.
    File(FileBody),
}

impl ResponseBody {
    /// Number of bytes the body will emit.
    pub fn len(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::Full(bytes) => bytes.len() as u64,
            Self::File(file) => file.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An HTTP/1.1 response, ready to be emitted by a backend adapter.
///
/// # Examples
///
/// ```
/// use tandem::http::{Cookie, Response, StatusCode};
///
/// let original = Response::new(StatusCode::Ok).with_body("hi");
/// let decorated = original
///     .with_header("X-Request-Id", "abc-123")
///     .with_cookie(Cookie::new("a", "1"))
///     .with_status(StatusCode::Accepted);
///
/// assert_eq!(original.status(), StatusCode::Ok);
/// assert!(original.headers().get("x-request-id").is_none());
/// assert_eq!(decorated.status(), StatusCode::Accepted);
/// assert_eq!(decorated.cookies().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: Arc<Headers>,
    cookies: Arc<Vec<Cookie>>,
    body: ResponseBody,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Arc::new(Headers::new()),
            cookies: Arc::new(Vec::new()),
            body: ResponseBody::Empty,
        }
    }

    /// Creates a JSON response.
    ///
    /// Non-ASCII characters and forward slashes are written as-is.
    ///
    /// # Errors
    ///
    /// [`HttpError::Json`] if `data` cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(data: &T) -> Result<Self, HttpError> {
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(StatusCode::Ok)
            .with_header("Content-Type", "application/json; charset=utf-8")
            .with_body(body))
    }

    /// Creates an HTML response.
    pub fn html(body: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.into())
    }

    /// Creates a `302 Found` redirect to `location`.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::new(StatusCode::Found).with_header("Location", location)
    }

    /// Creates a redirect with an explicit `3xx` status.
    ///
    /// # Errors
    ///
    /// [`HttpError::InvalidRedirect`] if `status` is not a redirection.
    pub fn redirect_with_status(
        location: impl Into<String>,
        status: StatusCode,
    ) -> Result<Self, HttpError> {
        if !status.is_redirection() {
            return Err(HttpError::InvalidRedirect(status));
        }
        Ok(Self::redirect(location).with_status(status))
    }

    /// Creates a file download response for `range` of the file at `path`.
    ///
    /// When `name` is `None` or empty, the attachment is named with ten random
    /// alphanumerics plus the original extension. The name is HTML-escaped
    /// and stripped of control characters before it goes into
    /// `Content-Disposition`.
    ///
    /// # Errors
    ///
    /// - [`HttpError::FileNotFound`] if `path` is not a regular file.
    /// - [`HttpError::RangeNotSatisfiable`] if `range` exceeds the file.
    pub async fn download(
        path: impl AsRef<Path>,
        name: Option<&str>,
        range: ByteRange,
    ) -> Result<Self, HttpError> {
        let path = path.as_ref();
        let file = FileBody::resolve(path, range).await?;
        let name = match name.filter(|n| !n.is_empty()) {
            Some(name) => name.to_owned(),
            None => random_file_name(path),
        };

        Ok(Self::new(StatusCode::Ok)
            .with_header("Pragma", "public")
            .with_header("Expires", "0")
            .with_header("Cache-Control", "must-revalidate, post-check=0, pre-check=0")
            .with_header("Content-Type", "application/download")
            .with_header("Content-Transfer-Encoding", "binary")
            .with_header(
                "Content-Disposition",
                format!("attachment;filename=\"{}\"", escape_file_name(&name)),
            )
            .with_file(file))
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Cookies attached with [`with_cookie`](Self::with_cookie), in emission order.
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Returns the body bytes when the body is buffered.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns a copy with a different status.
    #[must_use]
    pub fn with_status(&self, status: StatusCode) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    /// Returns a copy where `name` has exactly one value, `value`.
    #[must_use]
    pub fn with_header(&self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.headers).set(name, value);
        next
    }

    /// Returns a copy with `value` appended to the values of `name`.
    #[must_use]
    pub fn with_added_header(&self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.headers).insert(name, value);
        next
    }

    /// Returns a copy without any value for `name`.
    #[must_use]
    pub fn without_header(&self, name: &str) -> Self {
        if !self.headers.contains(name) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.headers).remove(name);
        next
    }

    /// Returns a copy carrying `cookie`.
    ///
    /// A cookie already attached for the same name, path, and domain is
    /// dropped, so the new one is the only one emitted for that slot.
    #[must_use]
    pub fn with_cookie(&self, cookie: Cookie) -> Self {
        let mut next = self.clone();
        let cookies = Arc::make_mut(&mut next.cookies);
        cookies.retain(|c| !c.same_slot(&cookie));
        cookies.push(cookie);
        next
    }

    /// Returns a copy with a buffered body.
    #[must_use]
    pub fn with_body(&self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            body: if body.is_empty() {
                ResponseBody::Empty
            } else {
                ResponseBody::Full(body)
            },
            ..self.clone()
        }
    }

    /// Returns a copy whose body streams a file range.
    #[must_use]
    pub fn with_file(&self, file: FileBody) -> Self {
        Self {
            body: ResponseBody::File(file),
            ..self.clone()
        }
    }

    /// Header lines in emission order: every header entry, then one
    /// `Set-Cookie` line per attached cookie.
    ///
    /// Repeated names stay separate entries; nothing is ever joined.
    pub fn header_lines(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .chain(
                self.cookies
                    .iter()
                    .map(|c| ("Set-Cookie".to_owned(), c.to_string())),
            )
            .collect()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

fn random_file_name(path: &Path) -> String {
    let stem: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    match path.extension().and_then(|e| e.to_str()).filter(|e| !e.is_empty()) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

// HTML-escapes `&`, `"`, `<`, `>` and drops control characters.
fn escape_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("tandem-resp-{}-{name}", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents)
            .unwrap();
        path
    }

    #[test]
    fn with_methods_never_touch_the_original() {
        let original = Response::new(StatusCode::Ok)
            .with_header("X-Trace", "1")
            .with_body("body");
        let snapshot = original.header_lines();

        let _ = original.with_header("X-Trace", "2");
        let _ = original.with_added_header("X-Other", "y");
        let _ = original.with_cookie(Cookie::new("a", "1"));
        let _ = original.with_status(StatusCode::NotFound);
        let _ = original.without_header("X-Trace");
        let _ = original.with_body("changed");

        assert_eq!(original.status(), StatusCode::Ok);
        assert_eq!(original.header_lines(), snapshot);
        assert!(original.cookies().is_empty());
        assert_eq!(original.body_bytes().unwrap(), "body");
    }

    #[test]
    fn two_cookies_are_two_lines() {
        let response = Response::new(StatusCode::Ok)
            .with_cookie(Cookie::new("a", "1").path("/"))
            .with_cookie(Cookie::new("b", "2").path("/"));
        let lines: Vec<_> = response
            .header_lines()
            .into_iter()
            .filter(|(k, _)| k == "Set-Cookie")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(lines, vec!["a=1; Path=/", "b=2; Path=/"]);
    }

    #[test]
    fn later_cookie_overrides_same_slot() {
        let response = Response::new(StatusCode::Ok)
            .with_cookie(Cookie::new("a", "1").path("/"))
            .with_cookie(Cookie::new("b", "2"))
            .with_cookie(Cookie::new("a", "3").path("/"))
            .with_cookie(Cookie::new("a", "4").path("/other"));
        let values: Vec<_> = response.cookies().iter().map(|c| c.to_string()).collect();
        assert_eq!(values, vec!["b=2", "a=3; Path=/", "a=4; Path=/other"]);
    }

    #[test]
    fn with_header_replaces_and_added_header_appends() {
        let response = Response::new(StatusCode::Ok)
            .with_added_header("Vary", "Origin")
            .with_added_header("Vary", "Accept");
        assert_eq!(response.headers().get_line("vary"), "Origin, Accept");
        let replaced = response.with_header("vary", "Cookie");
        assert_eq!(replaced.headers().get_line("Vary"), "Cookie");
    }

    #[test]
    fn json_leaves_unicode_and_slashes_unescaped() {
        let mut data = HashMap::new();
        data.insert("a", "日本");
        let response = Response::json(&data).unwrap();
        assert_eq!(
            response.headers().get("content-type"),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(response.body_bytes().unwrap(), "{\"a\":\"日本\"}");

        let url = serde_json::json!({ "u": "https://example.com/a/b" });
        let body = Response::json(&url).unwrap().body_bytes().unwrap().clone();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(text.contains("https://example.com/a/b"));
        assert!(!text.contains("\\/"));
    }

    #[test]
    fn html_and_redirect_factories() {
        let html = Response::html("<p>hi</p>");
        assert_eq!(
            html.headers().get("content-type"),
            Some("text/html; charset=utf-8")
        );

        let redirect = Response::redirect("/home");
        assert_eq!(redirect.status(), StatusCode::Found);
        assert_eq!(redirect.headers().get("location"), Some("/home"));

        let moved = Response::redirect_with_status("/new", StatusCode::MovedPermanently).unwrap();
        assert_eq!(moved.status(), StatusCode::MovedPermanently);
        assert!(matches!(
            Response::redirect_with_status("/x", StatusCode::Ok),
            Err(HttpError::InvalidRedirect(StatusCode::Ok))
        ));
    }

    #[tokio::test]
    async fn download_sets_attachment_headers() {
        let path = temp_file("report.csv", b"a,b\n1,2\n");
        let response = Response::download(&path, Some("q3 \"final\" <report>.csv"), ByteRange::FULL)
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers.get("pragma"), Some("public"));
        assert_eq!(headers.get("expires"), Some("0"));
        assert_eq!(
            headers.get("cache-control"),
            Some("must-revalidate, post-check=0, pre-check=0")
        );
        assert_eq!(
            headers.get("content-disposition"),
            Some("attachment;filename=\"q3 &quot;final&quot; &lt;report&gt;.csv\"")
        );
        assert_eq!(response.body().len(), 8);
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn download_generates_name_with_extension() {
        let path = temp_file("archive.tar", b"x");
        let response = Response::download(&path, None, ByteRange::FULL).await.unwrap();
        let disposition = response.headers().get("content-disposition").unwrap();
        let name = disposition
            .strip_prefix("attachment;filename=\"")
            .and_then(|s| s.strip_suffix('"'))
            .unwrap();
        assert_eq!(name.len(), "0123456789.tar".len());
        assert!(name.ends_with(".tar"));
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn download_errors_are_typed() {
        let missing = std::env::temp_dir().join("tandem-resp-missing.bin");
        assert!(matches!(
            Response::download(&missing, None, ByteRange::FULL).await,
            Err(HttpError::FileNotFound { .. })
        ));

        let path = temp_file("small.bin", b"12345");
        assert!(matches!(
            Response::download(&path, None, ByteRange::new(6, None)).await,
            Err(HttpError::RangeNotSatisfiable { .. })
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn control_characters_are_dropped_from_file_names() {
        assert_eq!(escape_file_name("a\r\nb&c.txt"), "ab&amp;c.txt");
    }
}
