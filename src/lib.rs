//! # tandem
//!
//! A thin HTTP/1.1 application framework: one middleware pipeline, served by
//! two interchangeable multi-worker socket backends.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tandem::{Application, Kernel, Response, Server, ServerConfig, VerifyCsrfToken};
//! use tandem::http::Request;
//! use tandem::middleware::LoggerMiddleware;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kernel = Kernel::builder()
//!         .middleware(LoggerMiddleware)
//!         .middleware(VerifyCsrfToken::new().except("/webhooks/*"))
//!         .handler(|req: Request| async move {
//!             Ok(Response::html(format!("Hello from {}", req.path())))
//!         })
//!         .build();
//!
//!     let config = ServerConfig::load("tandem.toml")?;
//!     let handle = Server::new(config, Application::new(kernel)).start()?;
//!     println!("Listening on http://{}", handle.local_addr());
//!     handle.wait();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod http;
pub mod kernel;
pub mod middleware;
pub mod registry;
pub mod security;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{BackendKind, ConfigError, ServerConfig};
pub use context::{Deadline, Session, WorkerContext};
pub use events::{EventDispatcher, RequestHandled};
pub use http::{Cookie, Headers, HttpError, Method, Request, Response, StatusCode};
pub use kernel::Kernel;
pub use middleware::{Middleware, Next};
pub use registry::{IdGenerator, Registry, RegistryBuilder};
pub use security::VerifyCsrfToken;
pub use server::{Application, Server, ServerError, ServerHandle};
