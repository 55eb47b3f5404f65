//! Dispatch backend: one acceptor thread, `N` worker threads.
//!
//! The acceptor hands each accepted socket to the next worker in turn.
//! Workers receive fully buffered [`NativeRequest`]s from the native layer and
//! answer through [`NativeResponse`](native::NativeResponse). The adapter in
//! this module maps between that shape and the shared model:
//!
//! - the ordered header list and the query, form and cookie maps become a
//!   [`Request`];
//! - bodies above `body_buffer_limit` are exposed as a stream over the
//!   received buffer and are never parsed;
//! - repeated response headers are joined with `", "`, except `Set-Cookie`,
//!   which is sent once per cookie;
//! - file bodies are written chunk by chunk.

pub mod native;

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use serde_json::{Map, Value};
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, warn};

use super::{
    Adapter, AdaptError, Application, EmitError, Emission, ServerError, Started, Worker,
    spawn_runtime_thread,
};
use crate::{
    config::ServerConfig,
    http::{
        BodyStream, ConnectionInfo, Method, Request, Response, ResponseBody, Version,
        body::CHUNK_SIZE,
    },
};

pub use native::{NativeConnection, NativeError, NativeRequest, NativeSettings};

impl From<NativeError> for AdaptError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Codec(err) => Self::Malformed(err),
            NativeError::PackageTooLarge(limit) => Self::TooLarge { limit },
            NativeError::Truncated => Self::Truncated,
            NativeError::Io(err) => Self::Io(err),
        }
    }
}

/// Translates between the native layer and the shared request model.
#[derive(Debug, Clone)]
pub struct DispatchAdapter {
    body_buffer_limit: usize,
    settings: NativeSettings,
}

impl DispatchAdapter {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            body_buffer_limit: config.body_buffer_limit,
            settings: NativeSettings {
                package_max_length: config.max_request_size,
                http_keepalive: config.keep_alive,
            },
        }
    }

    /// Settings handed to every [`NativeConnection`].
    pub fn settings(&self) -> NativeSettings {
        self.settings
    }

    /// Builds a [`Request`] from a native request.
    pub fn to_request(&self, native: NativeRequest, connection: ConnectionInfo) -> Request {
        let server = &native.server;
        let method = server
            .get("request_method")
            .map(|m| m.parse::<Method>().unwrap_or_else(|never| match never {}))
            .unwrap_or(Method::Get);
        let version = server
            .get("server_protocol")
            .and_then(|v| v.parse::<Version>().ok())
            .unwrap_or_default();
        let mut target = server
            .get("request_uri")
            .cloned()
            .unwrap_or_else(|| "/".to_owned());
        if let Some(query) = server.get("query_string").filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }

        let mut builder = Request::builder()
            .method(method)
            .target(target)
            .version(version)
            .connection(connection);
        for (name, value) in &native.header {
            builder = builder.header(name, value.as_str());
        }
        for (name, value) in &native.server {
            builder = builder.server_param(name, value.as_str());
        }
        builder = builder
            .query_params(native.get.clone())
            .cookies(native.cookie.clone());

        let form = (!native.post.is_empty()).then(|| form_fields(&native.post));
        let raw = native.into_raw_content();
        if raw.len() > self.body_buffer_limit {
            return builder
                .body_stream(BodyStream::buffered(raw, CHUNK_SIZE))
                .build();
        }
        if let Some(form) = form {
            builder = builder.parsed_body(form);
        }
        builder.body(raw).build()
    }
}

fn form_fields(post: &HashMap<String, String>) -> Map<String, Value> {
    post.iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect()
}

impl Adapter for DispatchAdapter {
    type Connection = NativeConnection;

    const NAME: &'static str = "dispatch";

    async fn adapt(&self, conn: &mut NativeConnection) -> Result<Option<Request>, AdaptError> {
        let Some(native) = conn.recv().await? else {
            return Ok(None);
        };
        let info = ConnectionInfo {
            remote_addr: Some(conn.remote_addr()),
            local_addr: conn.local_addr(),
            backend: Self::NAME,
        };
        Ok(Some(self.to_request(native, info)))
    }

    async fn emit(
        &self,
        conn: &mut NativeConnection,
        response: &Response,
        emission: Emission,
    ) -> Result<(), EmitError> {
        let mut res = conn.response();
        res.keep_alive(emission.keep_alive);
        let status = response.status();
        res.status(status.as_u16(), status.canonical_reason());

        let headers = response.headers();
        let mut names: Vec<&str> = Vec::new();
        for (name, _) in headers.iter() {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name);
            }
        }
        for name in names {
            if name.eq_ignore_ascii_case("set-cookie") {
                for line in headers.get_all(name) {
                    res.cookie(line);
                }
            } else {
                res.header(name, headers.get_line(name));
            }
        }
        for cookie in response.cookies() {
            res.cookie(cookie.to_string());
        }

        match response.body() {
            ResponseBody::Empty => res.end(None).await?,
            ResponseBody::Full(bytes) => res.end(Some(bytes.clone())).await?,
            ResponseBody::File(file) => {
                let mut chunks = file.open().await.map_err(EmitError::File)?;
                while let Some(chunk) = chunks.next_chunk().await.map_err(EmitError::File)? {
                    res.write(chunk).await?;
                }
                res.end(None).await?;
            }
        }
        Ok(())
    }
}

type Accepted = (std::net::TcpStream, SocketAddr);

pub(crate) fn start(
    config: &ServerConfig,
    app: &Arc<Application>,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
) -> Result<Started, ServerError> {
    let addr = config.addr()?;
    let listener =
        std::net::TcpListener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let adapter = Arc::new(DispatchAdapter::new(config));
    let mut threads = Vec::with_capacity(workers + 1);
    let mut queues = Vec::with_capacity(workers);

    for id in 0..workers {
        let (tx, rx) = mpsc::unbounded_channel::<Accepted>();
        queues.push(tx);
        let app = Arc::clone(app);
        let adapter = Arc::clone(&adapter);
        let shutdown = shutdown.clone();
        let keep_alive = config.keep_alive;

        let thread = spawn_runtime_thread(format!("tandem-dispatch-{id}"), move || async move {
            let Some(worker) = Worker::start(id, app, keep_alive) else {
                return;
            };
            worker_loop(worker, adapter, rx, shutdown).await;
        })?;
        threads.push(thread);
    }

    let shutdown = shutdown.clone();
    let acceptor = spawn_runtime_thread("tandem-dispatch-acceptor".to_owned(), move || async move {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "failed to register listener");
                return;
            }
        };
        accept_loop(listener, queues, shutdown).await;
    })?;
    threads.push(acceptor);

    Ok(Started {
        local_addr,
        threads,
    })
}

async fn accept_loop(
    listener: TcpListener,
    queues: Vec<mpsc::UnboundedSender<Accepted>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next = 0usize;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let stream = match stream.into_std() {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(peer = %remote_addr, error = %err, "failed to detach socket");
                        continue;
                    }
                };
                let worker = next % queues.len();
                next = next.wrapping_add(1);
                if queues[worker].send((stream, remote_addr)).is_err() {
                    warn!(worker, peer = %remote_addr, "worker is gone, dropping connection");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("acceptor stopping");
}

async fn worker_loop(
    worker: Arc<Worker>,
    adapter: Arc<DispatchAdapter>,
    mut queue: mpsc::UnboundedReceiver<Accepted>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    let mut fd: u64 = 0;
    loop {
        tokio::select! {
            received = queue.recv() => {
                let Some((stream, remote_addr)) = received else { break };
                let stream = match tokio::net::TcpStream::from_std(stream) {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(worker = worker.id(), error = %err, "failed to register socket");
                        continue;
                    }
                };
                fd += 1;
                debug!(worker = worker.id(), fd, peer = %remote_addr, "connection received");
                let conn = NativeConnection::new(fd, stream, remote_addr, adapter.settings());
                worker.spawn(&mut connections, &adapter, conn);
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!(worker = worker.id(), open = connections.len(), "worker stopping");
    connections.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Cookie, StatusCode};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    fn adapter(body_buffer_limit: usize) -> DispatchAdapter {
        DispatchAdapter::new(&ServerConfig {
            body_buffer_limit,
            ..ServerConfig::default()
        })
    }

    async fn pair(adapter: &DispatchAdapter) -> (NativeConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (NativeConnection::new(1, server, peer, adapter.settings()), client)
    }

    #[tokio::test]
    async fn native_maps_become_request() {
        let adapter = adapter(1024);
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(
                b"POST /form?page=2 HTTP/1.1\r\nCookie: sid=abc\r\nX-Trace: 1\r\n\
                  Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 9\r\n\r\nname=jane",
            )
            .await
            .unwrap();

        let request = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert_eq!(*request.method(), Method::Post);
        assert_eq!(request.uri(), "/form?page=2");
        assert_eq!(request.query("page"), Some("2"));
        assert_eq!(request.cookie("sid"), Some("abc"));
        assert_eq!(request.header("x-trace"), Some("1"));
        assert_eq!(request.post("name").and_then(|v| v.as_str()), Some("jane"));
        assert_eq!(request.server("request_method"), Some("POST"));
        assert_eq!(request.connection().backend, "dispatch");
        assert!(request.body().is_buffered());
    }

    #[tokio::test]
    async fn large_body_is_streamed() {
        let adapter = adapter(4);
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(b"POST /up HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789")
            .await
            .unwrap();
        let request = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert!(!request.body().is_buffered());
        assert_eq!(request.raw().await.unwrap(), &b"0123456789"[..]);
    }

    #[tokio::test]
    async fn emits_joined_headers_and_separate_cookies() {
        let adapter = adapter(1024);
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        adapter.adapt(&mut conn).await.unwrap().unwrap();

        let response = Response::new(StatusCode::Ok)
            .with_added_header("Vary", "Origin")
            .with_added_header("Vary", "Accept")
            .with_cookie(Cookie::new("a", "1"))
            .with_cookie(Cookie::new("b", "2"))
            .with_body("done");
        let emission = Emission {
            version: Version::Http11,
            head_only: false,
            keep_alive: false,
        };
        adapter.emit(&mut conn, &response, emission).await.unwrap();
        drop(conn);

        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Vary: Origin, Accept\r\n"));
        assert!(raw.contains("Set-Cookie: a=1\r\n"));
        assert!(raw.contains("Set-Cookie: b=2\r\n"));
        assert!(raw.contains("Content-Length: 4\r\n"));
        assert!(raw.ends_with("\r\n\r\ndone"));
    }

    #[tokio::test]
    async fn file_bodies_are_chunked() {
        let path = std::env::temp_dir().join(format!("tandem-dispatch-{}.txt", std::process::id()));
        tokio::fs::write(&path, b"chunked file").await.unwrap();

        let adapter = adapter(1024);
        let (mut conn, mut client) = pair(&adapter).await;
        client.write_all(b"GET /f HTTP/1.1\r\n\r\n").await.unwrap();
        adapter.adapt(&mut conn).await.unwrap().unwrap();

        let file = crate::http::FileBody::resolve(&path, crate::http::ByteRange::FULL)
            .await
            .unwrap();
        let response = Response::new(StatusCode::Ok).with_file(file);
        let emission = Emission {
            version: Version::Http11,
            head_only: false,
            keep_alive: false,
        };
        adapter.emit(&mut conn, &response, emission).await.unwrap();
        drop(conn);

        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert!(raw.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!raw.contains("Content-Length"));
        assert!(raw.ends_with("\r\n\r\nc\r\nchunked file\r\n0\r\n\r\n"));
    }
}
