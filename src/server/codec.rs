//! HTTP/1.1 wire format shared by both backends: request-head parsing with
//! [`httparse`] and response-head encoding.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use time::OffsetDateTime;

use crate::http::{Headers, Method, Response, Version, cookie::format_http_date};

/// Maximum number of request headers accepted.
pub const MAX_HEADERS: usize = 64;

/// Upper bound for a request line plus headers.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length")]
    InvalidLength,

    #[error("chunked request bodies are not supported")]
    Chunked,
}

/// A parsed request line and header block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl RequestHead {
    /// Declared body length; absent means zero.
    ///
    /// Values must be plain ASCII digits and repeated `Content-Length`
    /// headers must agree. `Transfer-Encoding` is rejected.
    pub fn content_length(&self) -> Result<u64, CodecError> {
        if self.headers.contains("transfer-encoding") {
            return Err(CodecError::Chunked);
        }
        let mut length = None;
        for value in self.headers.get_all("content-length") {
            let digits = value.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CodecError::InvalidLength);
            }
            let parsed: u64 = digits.parse().map_err(|_| CodecError::InvalidLength)?;
            match length {
                Some(previous) if previous != parsed => return Err(CodecError::InvalidLength),
                _ => length = Some(parsed),
            }
        }
        Ok(length.unwrap_or(0))
    }

    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == Version::Http11,
        }
    }
}

/// Parses a request head from the front of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, otherwise the head and
/// the offset at which the body begins.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Request::new(&mut headers);

    let body_offset = match raw.parse(buf)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Ok(None),
    };

    let method = raw
        .method
        .ok_or(CodecError::MissingField { field: "method" })?
        .parse::<Method>()
        .unwrap_or_else(|never| match never {});
    let target = raw
        .path
        .ok_or(CodecError::MissingField { field: "path" })?
        .to_owned();
    let version = Version::from_minor(
        raw.version
            .ok_or(CodecError::MissingField { field: "version" })?,
    );

    let mut header_map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            header_map.insert(header.name, value);
        }
    }

    Ok(Some((
        RequestHead {
            method,
            target,
            version,
            headers: header_map,
        },
        body_offset,
    )))
}

// Framing headers are always computed here.
const FRAMING: [&str; 3] = ["Content-Length", "Transfer-Encoding", "Connection"];

/// Encodes the status line and headers of `response`, terminated by the blank line.
///
/// `Content-Length` is taken from the body, `Connection` from `keep_alive`.
/// Every attached cookie becomes its own `Set-Cookie` line.
pub fn encode_head(response: &Response, version: Version, keep_alive: bool) -> BytesMut {
    let status = response.status();
    let lines = response.header_lines();
    let mut buf = BytesMut::with_capacity(128 + lines.len() * 64);

    buf.put(
        format!(
            "{} {} {}\r\n",
            version.as_str(),
            status.as_u16(),
            status.canonical_reason()
        )
        .as_bytes(),
    );

    for (name, value) in &lines {
        if FRAMING.iter().any(|f| f.eq_ignore_ascii_case(name)) {
            continue;
        }
        if value.contains(['\r', '\n']) {
            tracing::warn!(header = %name, "dropping header value containing CR/LF");
            continue;
        }
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }

    if !response.headers().contains("date") {
        if let Ok(date) = format_http_date(OffsetDateTime::now_utc()) {
            buf.put(format!("Date: {date}\r\n").as_bytes());
        }
    }

    let body_len = response.body().len();
    if body_len > 0 && !response.headers().contains("content-type") {
        buf.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
    }

    let connection = if keep_alive { "keep-alive" } else { "close" };
    buf.put(format!("Connection: {connection}\r\n").as_bytes());

    if !status.forbids_body() {
        buf.put(format!("Content-Length: {body_len}\r\n").as_bytes());
    }

    buf.put(&b"\r\n"[..]);
    buf
}
