//! Native connection layer of the dispatch backend.
//!
//! Mirrors the shape of an event-server's request and response objects:
//! requests arrive fully buffered with an ordered list of lower-cased
//! headers and single-valued parameter maps; responses are assembled with `status`, `header`,
//! `cookie`, `write` and `end` calls. Calling `write` before `end` switches
//! the response to chunked transfer encoding.

use std::{collections::HashMap, fmt, net::SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::{
    http::{Version, cookie::format_http_date, cookie::parse_cookie_header, request::parse_urlencoded},
    server::codec::{self, CodecError, MAX_HEAD_SIZE},
};

#[derive(Debug, Error)]
pub enum NativeError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("package exceeds {0} bytes")]
    PackageTooLarge(usize),

    #[error("connection closed mid-request")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level settings.
#[derive(Debug, Clone, Copy)]
pub struct NativeSettings {
    pub package_max_length: usize,
    pub http_keepalive: bool,
}

/// A fully received request.
#[derive(Debug, Clone)]
pub struct NativeRequest {
    pub fd: u64,
    /// Lower-cased header names in arrival order; repeated headers keep
    /// every value.
    pub header: Vec<(String, String)>,
    /// Lower-cased server parameters (`request_method`, `request_uri`, ...).
    pub server: HashMap<String, String>,
    pub get: HashMap<String, String>,
    /// Decoded `application/x-www-form-urlencoded` body fields.
    pub post: HashMap<String, String>,
    pub cookie: HashMap<String, String>,
    raw_content: Bytes,
}

impl NativeRequest {
    /// First value of the header `name` (lower-case).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn raw_content(&self) -> &Bytes {
        &self.raw_content
    }

    pub fn into_raw_content(self) -> Bytes {
        self.raw_content
    }
}

pub struct NativeConnection {
    fd: u64,
    stream: TcpStream,
    buf: BytesMut,
    settings: NativeSettings,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    // Framing of the most recent request.
    version: Version,
    head_only: bool,
    keep_alive: bool,
}

impl NativeConnection {
    pub fn new(fd: u64, stream: TcpStream, remote_addr: SocketAddr, settings: NativeSettings) -> Self {
        let local_addr = stream.local_addr().ok();
        Self {
            fd,
            stream,
            buf: BytesMut::with_capacity(4096),
            settings,
            remote_addr,
            local_addr,
            version: Version::Http11,
            head_only: false,
            keep_alive: false,
        }
    }

    pub fn fd(&self) -> u64 {
        self.fd
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Receives the next complete request; `Ok(None)` when the peer closed
    /// the connection between requests.
    pub async fn recv(&mut self) -> Result<Option<NativeRequest>, NativeError> {
        self.keep_alive = false;
        self.head_only = false;
        self.version = Version::Http11;

        let head_limit = MAX_HEAD_SIZE.min(self.settings.package_max_length);
        let (head, offset) = loop {
            if let Some(parsed) = codec::parse_head(&self.buf)? {
                break parsed;
            }
            if self.buf.len() > head_limit {
                return Err(NativeError::PackageTooLarge(head_limit));
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(NativeError::Truncated)
                };
            }
        };

        if offset > head_limit {
            return Err(NativeError::PackageTooLarge(head_limit));
        }

        let length = usize::try_from(head.content_length()?)
            .ok()
            .filter(|len| *len <= self.settings.package_max_length)
            .ok_or(NativeError::PackageTooLarge(self.settings.package_max_length))?;

        self.buf.advance(offset);
        while self.buf.len() < length {
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(NativeError::Truncated);
            }
        }
        let raw_content = self.buf.split_to(length).freeze();

        self.version = head.version;
        self.head_only = head.method.as_str() == "HEAD";
        self.keep_alive = self.settings.http_keepalive && head.is_keep_alive();

        let (path, query) = match head.target.split_once('?') {
            Some((path, query)) => (path.to_owned(), query.to_owned()),
            None => (head.target.clone(), String::new()),
        };

        let cookie_line = head.headers.get_all("cookie").collect::<Vec<_>>().join("; ");
        let cookie = parse_cookie_header(&cookie_line);

        let header: Vec<(String, String)> = head
            .headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.to_owned()))
            .collect();

        let post = match head.headers.get("content-type") {
            Some(ct) if ct.starts_with("application/x-www-form-urlencoded") => {
                parse_urlencoded(&String::from_utf8_lossy(&raw_content))
            }
            _ => HashMap::new(),
        };

        let now = OffsetDateTime::now_utc();
        let mut server = HashMap::from([
            ("request_method".to_owned(), head.method.as_str().to_owned()),
            ("request_uri".to_owned(), path.clone()),
            ("path_info".to_owned(), path),
            ("server_protocol".to_owned(), head.version.as_str().to_owned()),
            ("request_time".to_owned(), now.unix_timestamp().to_string()),
            (
                "request_time_float".to_owned(),
                format!("{:.6}", now.unix_timestamp_nanos() as f64 / 1e9),
            ),
            ("remote_addr".to_owned(), self.remote_addr.ip().to_string()),
            ("remote_port".to_owned(), self.remote_addr.port().to_string()),
        ]);
        if !query.is_empty() {
            server.insert("query_string".to_owned(), query.clone());
        }
        if let Some(local) = self.local_addr {
            server.insert("server_port".to_owned(), local.port().to_string());
        }

        Ok(Some(NativeRequest {
            fd: self.fd,
            header,
            server,
            get: parse_urlencoded(&query),
            post,
            cookie,
            raw_content,
        }))
    }

    /// Starts the response to the most recently received request.
    pub fn response(&mut self) -> NativeResponse<'_> {
        NativeResponse {
            keep_alive: self.keep_alive,
            conn: self,
            status: 200,
            reason: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            head_sent: false,
            chunked: false,
            finished: false,
        }
    }
}

impl fmt::Debug for NativeConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeConnection")
            .field("fd", &self.fd)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Response builder bound to one connection.
pub struct NativeResponse<'a> {
    conn: &'a mut NativeConnection,
    status: u16,
    reason: Option<&'static str>,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    head_sent: bool,
    chunked: bool,
    finished: bool,
    keep_alive: bool,
}

// Computed by the native layer; values set by callers are ignored.
const RESERVED: [&str; 4] = ["content-length", "transfer-encoding", "connection", "set-cookie"];

impl NativeResponse<'_> {
    pub fn status(&mut self, code: u16, reason: &'static str) {
        self.status = code;
        self.reason = Some(reason);
    }

    /// Sets a header, replacing a previous value of the same name.
    pub fn header(&mut self, name: &str, value: impl Into<String>) {
        if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            return;
        }
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name.to_owned(), value)),
        }
    }

    /// Adds one complete `Set-Cookie` value.
    pub fn cookie(&mut self, line: impl Into<String>) {
        self.cookies.push(line.into());
    }

    /// Downgrades the connection to close after this response.
    pub fn keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = self.keep_alive && keep_alive;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Sends a body chunk. The head goes out first with chunked framing on
    /// HTTP/1.1, or without framing and with the connection closing on
    /// HTTP/1.0.
    pub async fn write(&mut self, data: Bytes) -> std::io::Result<()> {
        if !self.head_sent {
            if self.conn.version == Version::Http10 {
                self.keep_alive = false;
            } else {
                self.chunked = true;
            }
            self.send_head(None).await?;
        }
        if self.conn.head_only || data.is_empty() || forbids_body(self.status) {
            return Ok(());
        }
        if self.chunked {
            let mut frame = BytesMut::with_capacity(data.len() + 16);
            frame.put(format!("{:x}\r\n", data.len()).as_bytes());
            frame.put(data);
            frame.put(&b"\r\n"[..]);
            self.conn.stream.write_all(&frame).await
        } else {
            self.conn.stream.write_all(&data).await
        }
    }

    /// Finishes the response. Without earlier `write` calls the head carries
    /// `Content-Length` of `data`.
    pub async fn end(&mut self, data: Option<Bytes>) -> std::io::Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.head_sent {
            if let Some(data) = data {
                self.write(data).await?;
            }
            if self.chunked && !self.conn.head_only && !forbids_body(self.status) {
                self.conn.stream.write_all(b"0\r\n\r\n").await?;
            }
        } else {
            let data = data.unwrap_or_default();
            self.send_head(Some(data.len())).await?;
            if !self.conn.head_only && !data.is_empty() && !forbids_body(self.status) {
                self.conn.stream.write_all(&data).await?;
            }
        }
        self.conn.stream.flush().await?;
        self.finished = true;
        if !self.keep_alive {
            let _ = self.conn.stream.shutdown().await;
        }
        Ok(())
    }

    async fn send_head(&mut self, content_length: Option<usize>) -> std::io::Result<()> {
        let mut head = BytesMut::with_capacity(256);
        head.put(
            format!(
                "{} {} {}\r\n",
                self.conn.version.as_str(),
                self.status,
                self.reason.unwrap_or("OK")
            )
            .as_bytes(),
        );
        let mut has_date = false;
        let mut has_type = false;
        for (name, value) in &self.headers {
            if value.contains(['\r', '\n']) {
                continue;
            }
            has_date |= name.eq_ignore_ascii_case("date");
            has_type |= name.eq_ignore_ascii_case("content-type");
            head.put(format!("{name}: {value}\r\n").as_bytes());
        }
        for line in &self.cookies {
            if !line.contains(['\r', '\n']) {
                head.put(format!("Set-Cookie: {line}\r\n").as_bytes());
            }
        }
        if !has_date {
            if let Ok(date) = format_http_date(OffsetDateTime::now_utc()) {
                head.put(format!("Date: {date}\r\n").as_bytes());
            }
        }
        let has_body = self.chunked || content_length.is_some_and(|len| len > 0);
        if has_body && !has_type {
            head.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        head.put(format!("Connection: {connection}\r\n").as_bytes());
        if !forbids_body(self.status) {
            if self.chunked {
                head.put(&b"Transfer-Encoding: chunked\r\n"[..]);
            } else if let Some(len) = content_length {
                head.put(format!("Content-Length: {len}\r\n").as_bytes());
            }
        }
        head.put(&b"\r\n"[..]);

        self.conn.stream.write_all(&head).await?;
        self.head_sent = true;
        Ok(())
    }
}

fn forbids_body(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}
