//! Multi-worker HTTP/1.1 servers over two socket backends.
//!
//! Both backends run `N` OS threads, each driving its own single-threaded
//! Tokio runtime, and both feed the same [`Application`]:
//!
//! - [`prefork`] — every worker owns a listener bound to the shared port with
//!   `SO_REUSEPORT`; the kernel balances new connections between them.
//! - [`dispatch`] — a single acceptor thread hands accepted sockets to the
//!   workers round-robin; workers read requests through a native request and
//!   response layer.
//!
//! An [`Adapter`] translates between a backend's connection and the shared
//! [`Request`]/[`Response`] model. The connection loop is the same for every
//! adapter:
//!
//! 1. `adapt` reads the next request (malformed or oversized input is
//!    answered with `400`/`413` and the connection closes);
//! 2. the [`Kernel`] produces exactly one response;
//! 3. `emit` writes it;
//! 4. the [`RequestHandled`] event is dispatched once;
//! 5. the connection is kept alive or closed.

pub mod codec;
pub mod dispatch;
pub mod prefork;

pub use dispatch::DispatchAdapter;
pub use prefork::PreforkAdapter;

use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    thread,
};

use thiserror::Error;
use tokio::{runtime, sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    StatusCode,
    config::{BackendKind, ConfigError, ServerConfig},
    context::WorkerContext,
    events::{EventDispatcher, Listener, RequestHandled},
    http::{HttpError, Method, Request, Response, Version},
    kernel::Kernel,
    registry::{IdError, IdGenerator, MAX_WORKER_ID, Registry, RegistryBuilder},
};

use codec::CodecError;

/// Errors produced while starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0} workers requested, at most {max} supported", max = MAX_WORKER_ID + 1)]
    TooManyWorkers(usize),
}

/// Why a backend could not produce a [`Request`] from its connection.
#[derive(Debug, Error)]
pub enum AdaptError {
    #[error("malformed request: {0}")]
    Malformed(#[from] CodecError),

    #[error("request exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("connection closed mid-request")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AdaptError {
    /// The status to answer with before closing, if the peer can still be answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Malformed(_) => Some(StatusCode::BadRequest),
            Self::TooLarge { .. } => Some(StatusCode::PayloadTooLarge),
            Self::Truncated | Self::Io(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read response file: {0}")]
    File(#[source] io::Error),
}

/// Framing decisions for one emitted response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub version: Version,
    /// The request was `HEAD`: write the head only.
    pub head_only: bool,
    pub keep_alive: bool,
}

impl Emission {
    /// Framing for an error answered before any request was parsed.
    pub fn closing() -> Self {
        Self {
            version: Version::Http11,
            head_only: false,
            keep_alive: false,
        }
    }
}

/// Translation between a backend's native connection and the shared model.
pub trait Adapter: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Short backend name used in logs and [`ConnectionInfo`](crate::http::ConnectionInfo).
    const NAME: &'static str;

    /// Reads the next request. `Ok(None)` means the peer closed the
    /// connection cleanly between requests.
    fn adapt(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<Option<Request>, AdaptError>> + Send;

    /// Writes `response` in full. Partial writes are retried until the
    /// response is complete or the connection fails.
    fn emit(
        &self,
        conn: &mut Self::Connection,
        response: &Response,
        emission: Emission,
    ) -> impl Future<Output = Result<(), EmitError>> + Send;
}

type WorkerHook = dyn Fn(usize, &mut RegistryBuilder) + Send + Sync;

/// Everything a worker needs to serve requests: the kernel, the completion
/// listeners and the worker startup hooks.
pub struct Application {
    kernel: Kernel,
    events: EventDispatcher,
    worker_hooks: Vec<Arc<WorkerHook>>,
}

impl Application {
    /// Wraps `kernel` with no listeners and no worker hooks.
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            events: EventDispatcher::new(),
            worker_hooks: Vec::new(),
        }
    }

    /// Registers a completion listener.
    #[must_use]
    pub fn listen(mut self, listener: impl Listener + 'static) -> Self {
        self.events.add_listener(listener);
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Runs `hook` on every worker before it accepts connections.
    ///
    /// The hook receives the worker id and the worker's registry builder,
    /// which already holds an [`IdGenerator`] for that worker.
    #[must_use]
    pub fn on_worker_start(
        mut self,
        hook: impl Fn(usize, &mut RegistryBuilder) + Send + Sync + 'static,
    ) -> Self {
        self.worker_hooks.push(Arc::new(hook));
        self
    }

    /// The pipeline every worker serves.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    fn worker_registry(&self, id: usize) -> Result<Registry, IdError> {
        let mut builder = Registry::builder();
        builder.singleton(IdGenerator::new(id as u64)?);
        for hook in &self.worker_hooks {
            hook(id, &mut builder);
        }
        Ok(builder.build())
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("kernel", &self.kernel)
            .field("events", &self.events)
            .field("worker_hooks", &self.worker_hooks.len())
            .finish()
    }
}

/// Per-worker state shared by all of that worker's connections.
pub(crate) struct Worker {
    context: WorkerContext,
    app: Arc<Application>,
    keep_alive: bool,
}

impl Worker {
    /// Builds the worker's registry. Runs on the worker thread.
    pub(crate) fn start(id: usize, app: Arc<Application>, keep_alive: bool) -> Option<Arc<Self>> {
        match app.worker_registry(id) {
            Ok(registry) => {
                debug!(worker = id, singletons = registry.len(), "worker started");
                Some(Arc::new(Self {
                    context: WorkerContext::new(id, Arc::new(registry)),
                    app,
                    keep_alive,
                }))
            }
            Err(err) => {
                error!(worker = id, error = %err, "worker failed to start");
                None
            }
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.context.id()
    }

    pub(crate) fn spawn<A: Adapter>(
        self: &Arc<Self>,
        connections: &mut JoinSet<()>,
        adapter: &Arc<A>,
        conn: A::Connection,
    ) {
        let worker = Arc::clone(self);
        let adapter = Arc::clone(adapter);
        connections.spawn(async move { worker.serve(adapter.as_ref(), conn).await });
    }

    /// Serves one connection until it closes.
    pub(crate) async fn serve<A: Adapter>(&self, adapter: &A, mut conn: A::Connection) {
        loop {
            let request = match adapter.adapt(&mut conn).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!(worker = self.id(), backend = A::NAME, "connection closed by peer");
                    break;
                }
                Err(err) => {
                    match err.status() {
                        Some(status) => {
                            warn!(worker = self.id(), backend = A::NAME, error = %err, "rejecting request");
                            let response = HttpError::abort(status, err.to_string()).into_response();
                            if let Err(err) = adapter.emit(&mut conn, &response, Emission::closing()).await {
                                debug!(error = %err, "failed to send rejection");
                            }
                        }
                        None => debug!(worker = self.id(), backend = A::NAME, error = %err, "connection dropped"),
                    }
                    break;
                }
            };

            let emission = Emission {
                version: request.version(),
                head_only: *request.method() == Method::Head,
                keep_alive: self.keep_alive && request.is_keep_alive(),
            };
            let request = request.with_attribute(self.context.clone());

            debug!(
                worker = self.id(),
                method = %request.method(),
                path = %request.path(),
                "dispatching request"
            );
            let response = self.app.kernel.handle(request.clone()).await;
            let emitted = adapter.emit(&mut conn, &response, emission).await;

            self.app.events.dispatch(&RequestHandled { request, response });

            if let Err(err) = emitted {
                debug!(worker = self.id(), backend = A::NAME, error = %err, "emission failed");
                break;
            }
            if !emission.keep_alive {
                break;
            }
        }
    }
}

/// Spawns an OS thread that drives `task` on its own current-thread runtime.
pub(crate) fn spawn_runtime_thread<F, Fut>(name: String, task: F) -> io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    thread::Builder::new().name(name.clone()).spawn(move || {
        let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(thread = %name, error = %err, "failed to build runtime");
                return;
            }
        };
        runtime.block_on(task());
    })
}

/// Threads and address of a started backend.
pub(crate) struct Started {
    pub(crate) local_addr: SocketAddr,
    pub(crate) threads: Vec<thread::JoinHandle<()>>,
}

/// A configured, not yet started server.
///
/// # Examples
///
/// ```rust,no_run
/// use tandem::{Application, Kernel, Response, Server, ServerConfig};
/// use tandem::http::Request;
///
/// let kernel = Kernel::builder()
///     .handler(|_req: Request| async { Ok(Response::html("Hello!")) })
///     .build();
/// let handle = Server::new(ServerConfig::default(), Application::new(kernel))
///     .start()
///     .expect("server starts");
/// handle.wait();
/// ```
pub struct Server {
    config: ServerConfig,
    app: Arc<Application>,
}

impl Server {
    /// A timeout set on the kernel builder takes precedence over
    /// `request_timeout_secs`.
    pub fn new(config: ServerConfig, mut app: Application) -> Self {
        if app.kernel.timeout().is_none() && config.request_timeout().is_some() {
            app.kernel = app.kernel.with_timeout(config.request_timeout());
        }
        Self {
            config,
            app: Arc::new(app),
        }
    }

    /// Binds the listening socket and starts every worker thread.
    ///
    /// Binding happens before this returns, so with port `0` the actual port
    /// is available from [`ServerHandle::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound and
    /// [`ServerError::Config`] if the configuration is invalid.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;
        let workers = self.config.worker_count();
        if workers as u64 > MAX_WORKER_ID + 1 {
            return Err(ServerError::TooManyWorkers(workers));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let started = match self.config.backend {
            BackendKind::Prefork => prefork::start(&self.config, &self.app, workers, &shutdown_rx)?,
            BackendKind::Dispatch => dispatch::start(&self.config, &self.app, workers, &shutdown_rx)?,
        };

        info!(
            address = %started.local_addr,
            backend = self.config.backend.as_str(),
            workers,
            stages = ?self.app.kernel.stage_names(),
            pid = std::process::id(),
            version = env!("CARGO_PKG_VERSION"),
            "tandem listening on http://{}",
            started.local_addr
        );

        Ok(ServerHandle {
            local_addr: started.local_addr,
            backend: self.config.backend,
            shutdown: shutdown_tx,
            threads: started.threads,
        })
    }
}

/// A running server.
///
/// Dropping the handle signals every worker to stop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    backend: BackendKind,
    shutdown: watch::Sender<bool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server is bound to, with the resolved port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Backend the workers were started with.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Signals every worker to stop accepting and close its connections.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Blocks until every worker thread has exited.
    pub fn wait(self) {
        let Self {
            shutdown, threads, ..
        } = self;
        join_all(threads);
        drop(shutdown);
    }

    /// Shuts down and waits for the workers without blocking the caller's runtime.
    pub async fn stop(self) {
        self.shutdown();
        let Self {
            shutdown, threads, ..
        } = self;
        if tokio::task::spawn_blocking(move || join_all(threads)).await.is_err() {
            error!("failed to join worker threads");
        }
        drop(shutdown);
    }
}

fn join_all(threads: Vec<thread::JoinHandle<()>>) {
    for thread in threads {
        let name = thread.thread().name().unwrap_or("worker").to_owned();
        if thread.join().is_err() {
            error!(thread = %name, "worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, sync::Mutex};
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };

    fn app() -> Application {
        Application::new(Kernel::builder().build())
    }

    #[test]
    fn each_worker_registry_holds_its_own_generator() {
        let app = app();
        let first = app.worker_registry(0).unwrap().resolve::<IdGenerator>().unwrap();
        let second = app.worker_registry(1).unwrap().resolve::<IdGenerator>().unwrap();
        assert_eq!(first.worker_id(), 0);
        assert_eq!(second.worker_id(), 1);

        let mut ids = HashSet::new();
        for _ in 0..2000 {
            assert!(ids.insert(first.next_id().unwrap()));
            assert!(ids.insert(second.next_id().unwrap()));
        }
    }

    #[test]
    fn startup_hooks_run_once_per_worker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let app = Arc::new(app().on_worker_start(move |id, registry| {
            assert!(registry.contains::<IdGenerator>());
            registry.singleton(format!("worker-{id}"));
            hook_seen.lock().unwrap().push(id);
        }));

        let workers: Vec<_> = (0..2)
            .map(|id| Worker::start(id, Arc::clone(&app), true).unwrap())
            .collect();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        for (id, worker) in workers.iter().enumerate() {
            assert_eq!(worker.id(), id);
            let registry = worker.context.registry();
            assert_eq!(registry.resolve::<IdGenerator>().unwrap().worker_id(), id as u64);
            assert_eq!(*registry.resolve::<String>().unwrap(), format!("worker-{id}"));
        }
    }

    #[test]
    fn worker_index_outside_id_space_fails_to_start() {
        let app = Arc::new(app());
        assert!(Worker::start(MAX_WORKER_ID as usize + 1, app, true).is_none());
    }

    #[test]
    fn too_many_workers_is_rejected_before_binding() {
        let config = ServerConfig {
            port: 0,
            workers: 1025,
            ..ServerConfig::default()
        };
        let result = Server::new(config, app()).start();
        assert!(matches!(result, Err(ServerError::TooManyWorkers(1025))));
    }

    #[test]
    fn config_timeout_applies_unless_kernel_sets_one() {
        let config = ServerConfig {
            request_timeout_secs: Some(3),
            ..ServerConfig::default()
        };
        let server = Server::new(config.clone(), app());
        assert_eq!(server.app.kernel().timeout(), Some(std::time::Duration::from_secs(3)));

        let kernel = Kernel::builder()
            .timeout(std::time::Duration::from_secs(1))
            .build();
        let server = Server::new(config, Application::new(kernel));
        assert_eq!(server.app.kernel().timeout(), Some(std::time::Duration::from_secs(1)));
    }

    async fn adapt_on_both(raw: &[u8], body_buffer_limit: usize) -> (Request, Request) {
        let config = ServerConfig {
            body_buffer_limit,
            ..ServerConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prefork = PreforkAdapter::new(&config);
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = prefork.connection(stream, peer);
        client.write_all(raw).await.unwrap();
        let from_prefork = prefork.adapt(&mut conn).await.unwrap().unwrap();

        let dispatch = DispatchAdapter::new(&config);
        let mut client2 = TcpStream::connect(addr).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        let mut conn = dispatch::NativeConnection::new(1, stream, peer, dispatch.settings());
        client2.write_all(raw).await.unwrap();
        let from_dispatch = dispatch.adapt(&mut conn).await.unwrap().unwrap();

        (from_prefork, from_dispatch)
    }

    async fn assert_same_request(a: &Request, b: &Request) {
        assert_eq!(a.method(), b.method());
        assert_eq!(a.uri(), b.uri());
        assert_eq!(a.version(), b.version());
        let headers = |r: &Request| {
            r.headers()
                .iter()
                .map(|(n, v)| (n.to_owned(), v.to_owned()))
                .collect::<Vec<_>>()
        };
        assert_eq!(headers(a), headers(b));
        assert_eq!(a.query_params(), b.query_params());
        assert_eq!(a.cookies(), b.cookies());
        assert_eq!(a.parsed_body(), b.parsed_body());
        assert_eq!(a.body().is_buffered(), b.body().is_buffered());
        assert_eq!(a.raw().await.unwrap(), b.raw().await.unwrap());
    }

    const FORM_WITH_REPEATED_TOKEN: &[u8] = b"POST /submit?page=2 HTTP/1.1\r\n\
        Host: test\r\nCookie: X-XSRF-TOKEN=abc\r\n\
        X-Csrf-Token: first\r\nX-Csrf-Token: second\r\n\
        Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 32\r\n\r\n\
        _token=abcdefabcdefabcdef&x=1234";

    #[tokio::test]
    async fn backends_agree_on_large_form_with_repeated_headers() {
        let (prefork, dispatch) = adapt_on_both(FORM_WITH_REPEATED_TOKEN, 8).await;

        assert_eq!(prefork.header("x-csrf-token"), Some("first"));
        assert_eq!(
            dispatch.headers().get_all("x-csrf-token").collect::<Vec<_>>(),
            vec!["first", "second"]
        );
        assert!(dispatch.post("_token").is_none());
        assert!(!dispatch.body().is_buffered());
        assert_same_request(&prefork, &dispatch).await;
    }

    #[tokio::test]
    async fn backends_agree_on_buffered_form() {
        let (prefork, dispatch) = adapt_on_both(FORM_WITH_REPEATED_TOKEN, 1024).await;

        assert_eq!(
            dispatch.post("_token").and_then(|v| v.as_str()),
            Some("abcdefabcdefabcdef")
        );
        assert_same_request(&prefork, &dispatch).await;
    }
}
