//! Prefork backend: one `SO_REUSEPORT` listener per worker thread.
//!
//! Requests are parsed straight off the socket with [`httparse`]. Bodies up
//! to `body_buffer_limit` are read in full before the kernel runs; larger
//! bodies are streamed to the handler by a pump task that hands the read half
//! of the socket back once the body has been consumed. Responses are written
//! with `Content-Length` framing; file bodies go out in 64 KiB chunks.

use std::{cmp, io, net::SocketAddr, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{oneshot, watch},
    task::JoinSet,
};
use tracing::{debug, error};

use super::{
    Adapter, AdaptError, Application, EmitError, Emission, ServerError, Started, Worker,
    codec::{self, MAX_HEAD_SIZE},
    spawn_runtime_thread,
};
use crate::{
    config::ServerConfig,
    http::{
        BodyStream, ConnectionInfo, Request, Response, ResponseBody,
        body::{BodySender, CHUNK_SIZE},
    },
};

/// Chunks buffered between the socket pump and a slow body reader.
const BODY_CHANNEL_CAPACITY: usize = 8;

/// Small buffered bodies are written together with the head.
const COALESCE_LIMIT: usize = 16 * 1024;

const LISTEN_BACKLOG: i32 = 1024;

/// Reads requests straight off the socket and writes raw HTTP/1.1.
#[derive(Debug, Clone)]
pub struct PreforkAdapter {
    body_buffer_limit: usize,
    max_request_size: usize,
}

impl PreforkAdapter {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            body_buffer_limit: config.body_buffer_limit,
            max_request_size: config.max_request_size,
        }
    }

    /// Wraps an accepted stream.
    pub fn connection(&self, stream: TcpStream, remote_addr: SocketAddr) -> PreforkConnection {
        let info = ConnectionInfo {
            remote_addr: Some(remote_addr),
            local_addr: stream.local_addr().ok(),
            backend: Self::NAME,
        };
        let (reader, writer) = stream.into_split();
        PreforkConnection {
            reader: Some(reader),
            writer,
            buf: BytesMut::with_capacity(4096),
            pending: None,
            info,
        }
    }
}

/// Read half and unread bytes returned by a finished body pump.
struct Reclaimed {
    reader: OwnedReadHalf,
    leftover: BytesMut,
}

pub struct PreforkConnection {
    // `None` while a body pump owns the read half.
    reader: Option<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buf: BytesMut,
    pending: Option<oneshot::Receiver<Reclaimed>>,
    info: ConnectionInfo,
}

impl PreforkConnection {
    /// Waits for an in-flight body pump and takes the read half back.
    async fn reclaim(&mut self) -> Result<(), AdaptError> {
        if let Some(pending) = self.pending.take() {
            let Reclaimed { reader, leftover } =
                pending.await.map_err(|_| AdaptError::Truncated)?;
            self.reader = Some(reader);
            self.buf.extend_from_slice(&leftover);
        }
        Ok(())
    }
}

impl Adapter for PreforkAdapter {
    type Connection = PreforkConnection;

    const NAME: &'static str = "prefork";

    async fn adapt(&self, conn: &mut PreforkConnection) -> Result<Option<Request>, AdaptError> {
        conn.reclaim().await?;
        let Some(reader) = conn.reader.as_mut() else {
            return Ok(None);
        };

        let head_limit = cmp::min(MAX_HEAD_SIZE, self.max_request_size);
        let (head, offset) = loop {
            if let Some(parsed) = codec::parse_head(&conn.buf)? {
                break parsed;
            }
            if conn.buf.len() > head_limit {
                return Err(AdaptError::TooLarge { limit: head_limit });
            }
            if reader.read_buf(&mut conn.buf).await? == 0 {
                return if conn.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(AdaptError::Truncated)
                };
            }
        };
        if offset > head_limit {
            return Err(AdaptError::TooLarge { limit: head_limit });
        }
        conn.buf.advance(offset);

        let length = head.content_length()?;
        let length = usize::try_from(length)
            .ok()
            .filter(|len| *len <= self.max_request_size)
            .ok_or(AdaptError::TooLarge {
                limit: self.max_request_size,
            })?;

        let expects_continue = head
            .headers
            .get("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));
        if expects_continue && conn.buf.len() < length {
            conn.writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
        }

        let builder = Request::builder()
            .method(head.method)
            .target(head.target)
            .version(head.version)
            .headers(head.headers)
            .connection(conn.info.clone());

        let request = if length == 0 {
            builder.build()
        } else if length <= self.body_buffer_limit {
            while conn.buf.len() < length {
                if reader.read_buf(&mut conn.buf).await? == 0 {
                    return Err(AdaptError::Truncated);
                }
            }
            builder.body(conn.buf.split_to(length).freeze()).build()
        } else if conn.buf.len() >= length {
            let body = conn.buf.split_to(length).freeze();
            builder.body_stream(BodyStream::buffered(body, CHUNK_SIZE)).build()
        } else {
            let Some(reader) = conn.reader.take() else {
                return Err(AdaptError::Truncated);
            };
            let first = conn.buf.split().freeze();
            let remaining = (length - first.len()) as u64;
            let (sender, stream) = BodyStream::channel(BODY_CHANNEL_CAPACITY);
            let (done, pending) = oneshot::channel();
            tokio::spawn(pump_body(reader, first, remaining, sender, done));
            conn.pending = Some(pending);
            builder.body_stream(stream).build()
        };

        Ok(Some(request))
    }

    async fn emit(
        &self,
        conn: &mut PreforkConnection,
        response: &Response,
        emission: Emission,
    ) -> Result<(), EmitError> {
        let mut head = codec::encode_head(response, emission.version, emission.keep_alive);
        let send_body = !emission.head_only && !response.status().forbids_body();

        match response.body() {
            ResponseBody::Full(bytes) if send_body && bytes.len() <= COALESCE_LIMIT => {
                head.extend_from_slice(bytes);
                conn.writer.write_all(&head).await?;
            }
            ResponseBody::Full(bytes) if send_body => {
                conn.writer.write_all(&head).await?;
                conn.writer.write_all(bytes).await?;
            }
            ResponseBody::File(file) if send_body => {
                conn.writer.write_all(&head).await?;
                let mut chunks = file.open().await.map_err(EmitError::File)?;
                while let Some(chunk) = chunks.next_chunk().await.map_err(EmitError::File)? {
                    conn.writer.write_all(&chunk).await?;
                }
            }
            _ => conn.writer.write_all(&head).await?,
        }

        conn.writer.flush().await?;
        Ok(())
    }
}

/// Feeds the rest of a large body into the request's stream, then returns
/// the read half. Once the reader is gone the remaining bytes are discarded so
/// the next request starts at the right offset.
async fn pump_body(
    mut reader: OwnedReadHalf,
    first: Bytes,
    mut remaining: u64,
    sender: BodySender,
    done: oneshot::Sender<Reclaimed>,
) {
    let mut open = first.is_empty() || sender.send(Ok(first)).await.is_ok();
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);

    while remaining > 0 {
        buf.reserve(CHUNK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                if open {
                    let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-body");
                    let _ = sender.send(Err(eof)).await;
                }
                return;
            }
            Ok(_) => {
                let take = cmp::min(buf.len() as u64, remaining) as usize;
                let chunk = buf.split_to(take).freeze();
                remaining -= take as u64;
                if open {
                    open = sender.send(Ok(chunk)).await.is_ok();
                }
            }
            Err(err) => {
                if open {
                    let _ = sender.send(Err(err)).await;
                }
                return;
            }
        }
    }

    drop(sender);
    let _ = done.send(Reclaimed {
        reader,
        leftover: buf,
    });
}

/// Creates a socket with SO_REUSEPORT so every worker can bind the same port.
fn reuse_port_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(unix)]
fn worker_listener(_first: &std::net::TcpListener, addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    reuse_port_listener(addr)
}

// Without SO_REUSEPORT the workers share one accept queue.
#[cfg(not(unix))]
fn worker_listener(first: &std::net::TcpListener, _addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    first.try_clone()
}

pub(crate) fn start(
    config: &ServerConfig,
    app: &Arc<Application>,
    workers: usize,
    shutdown: &watch::Receiver<bool>,
) -> Result<Started, ServerError> {
    let addr = config.addr()?;
    let first = reuse_port_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
    // With port 0 the remaining workers must bind the port the kernel picked.
    let local_addr = first.local_addr()?;

    let mut listeners = Vec::with_capacity(workers);
    for _ in 1..workers {
        let listener = worker_listener(&first, local_addr).map_err(|source| ServerError::Bind {
            addr: local_addr,
            source,
        })?;
        listeners.push(listener);
    }
    listeners.insert(0, first);

    let adapter = Arc::new(PreforkAdapter::new(config));
    let mut threads = Vec::with_capacity(workers);
    for (id, listener) in listeners.into_iter().enumerate() {
        let app = Arc::clone(app);
        let adapter = Arc::clone(&adapter);
        let shutdown = shutdown.clone();
        let keep_alive = config.keep_alive;

        let thread = spawn_runtime_thread(format!("tandem-prefork-{id}"), move || async move {
            let Some(worker) = Worker::start(id, app, keep_alive) else {
                return;
            };
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(err) => {
                    error!(worker = id, error = %err, "failed to register listener");
                    return;
                }
            };
            accept_loop(listener, worker, adapter, shutdown).await;
        })?;
        threads.push(thread);
    }

    Ok(Started {
        local_addr,
        threads,
    })
}

async fn accept_loop(
    listener: TcpListener,
    worker: Arc<Worker>,
    adapter: Arc<PreforkAdapter>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(worker = worker.id(), error = %err, "failed to accept connection");
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                debug!(worker = worker.id(), peer = %remote_addr, "connection accepted");
                let conn = adapter.connection(stream, remote_addr);
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
    use crate::{StatusCode, http::Method};

    fn config(body_buffer_limit: usize) -> ServerConfig {
        ServerConfig {
            body_buffer_limit,
            max_request_size: 1024,
            ..ServerConfig::default()
        }
    }

    async fn pair(adapter: &PreforkAdapter) -> (PreforkConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (adapter.connection(server, peer), client)
    }

    #[tokio::test]
    async fn adapts_pipelined_requests() {
        let adapter = PreforkAdapter::new(&config(512));
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(
                b"POST /a?x=1 HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\
                  Content-Length: 5\r\n\r\nk=abcGET /b HTTP/1.1\r\n\r\n",
            )
            .await
            .unwrap();

        let first = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert_eq!(*first.method(), Method::Post);
        assert_eq!(first.query("x"), Some("1"));
        assert_eq!(first.post("k").and_then(|v| v.as_str()), Some("abc"));
        assert_eq!(first.connection().backend, "prefork");

        let second = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert_eq!(second.path(), "/b");

        drop(client);
        assert!(adapter.adapt(&mut conn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_bodies_are_streamed_then_reclaimed() {
        let adapter = PreforkAdapter::new(&config(8));
        let (mut conn, mut client) = pair(&adapter).await;
        let body = "x".repeat(300);
        client
            .write_all(format!("POST /up HTTP/1.1\r\nContent-Length: 300\r\n\r\n{body}GET /next HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();

        let request = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert!(!request.body().is_buffered());
        assert_eq!(request.raw().await.unwrap(), body.as_bytes());
        drop(request);

        let next = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert_eq!(next.path(), "/next");
    }

    #[tokio::test]
    async fn unread_streamed_body_is_drained() {
        let adapter = PreforkAdapter::new(&config(8));
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(format!("POST /up HTTP/1.1\r\nContent-Length: 64\r\n\r\n{}", "y".repeat(64)).as_bytes())
            .await
            .unwrap();
        drop(adapter.adapt(&mut conn).await.unwrap().unwrap());

        client.write_all(b"GET /after HTTP/1.1\r\n\r\n").await.unwrap();
        let next = adapter.adapt(&mut conn).await.unwrap().unwrap();
        assert_eq!(next.path(), "/after");
    }

    #[tokio::test]
    async fn oversized_and_malformed_requests() {
        let adapter = PreforkAdapter::new(&config(512));
        let (mut conn, mut client) = pair(&adapter).await;
        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n")
            .await
            .unwrap();
        let err = adapter.adapt(&mut conn).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::PayloadTooLarge));

        let (mut conn, mut client) = pair(&adapter).await;
        client.write_all(b"NOT HTTP\r\n\r\n").await.unwrap();
        let err = adapter.adapt(&mut conn).await.unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::BadRequest));
    }

    #[tokio::test]
    async fn head_is_bounded_by_max_request_size() {
        let adapter = PreforkAdapter::new(&config(512));
        let (mut conn, mut client) = pair(&adapter).await;
        let raw = format!("GET / HTTP/1.1\r\nX-Padding: {}\r\n\r\n", "a".repeat(2048));
        client.write_all(raw.as_bytes()).await.unwrap();

        let err = adapter.adapt(&mut conn).await.unwrap_err();
        assert!(matches!(err, AdaptError::TooLarge { limit: 1024 }), "{err:?}");
        assert_eq!(err.status(), Some(StatusCode::PayloadTooLarge));
    }

    #[tokio::test]
    async fn head_requests_get_no_body() {
        let adapter = PreforkAdapter::new(&config(512));
        let (mut conn, mut client) = pair(&adapter).await;
        let response = Response::html("hello");
        let emission = Emission {
            version: crate::http::Version::Http11,
            head_only: true,
            keep_alive: false,
        };
        adapter.emit(&mut conn, &response, emission).await.unwrap();
        drop(conn);

        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        assert!(raw.contains("Content-Length: 5\r\n"));
        assert!(raw.ends_with("\r\n\r\n"));
    }
}
