//! Minimal application served by either backend.
//!
//! ```text
//! cargo run --example hello                 # prefork on 127.0.0.1:8080
//! cargo run --example hello -- tandem.toml  # settings from a TOML file
//! RUST_LOG=tandem=debug cargo run --example hello
//! ```

use std::{sync::Arc, time::Duration};

use tandem::{
    Application, Kernel, RequestHandled, Response, Server, ServerConfig, StatusCode,
    VerifyCsrfToken, WorkerContext,
    http::{HttpError, Request},
    middleware::LoggerMiddleware,
    registry::IdGenerator,
};
use tracing_subscriber::EnvFilter;

async fn route(req: Request) -> Result<Response, HttpError> {
    let worker = req.attribute::<WorkerContext>().cloned();
    match (req.method().as_str(), req.path()) {
        ("GET", "/") => {
            let id = worker
                .as_ref()
                .and_then(|w| w.registry().get::<IdGenerator>())
                .and_then(|ids| ids.next_id().ok())
                .unwrap_or_default();
            Ok(Response::html(format!(
                "<h1>Hello from worker {}</h1><p>request id {id}</p>",
                worker.map(|w| w.id()).unwrap_or_default()
            )))
        }
        ("POST", "/echo") => Response::json(&req.all()),
        ("GET", "/slow") => {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Response::html("done"))
        }
        _ => Err(HttpError::abort(StatusCode::NotFound, format!("no route for {}", req.path()))),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tandem=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    let kernel = Kernel::builder()
        .middleware(LoggerMiddleware)
        .middleware(VerifyCsrfToken::new().except("/echo"))
        .handler(route)
        .timeout(Duration::from_secs(5))
        .build();

    let served = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter = Arc::clone(&served);
    let app = Application::new(kernel)
        .listen(move |event: &RequestHandled| {
            let total = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            tracing::debug!(status = %event.response.status(), total, "request handled");
        })
        .on_worker_start(|id, _registry| tracing::info!(worker = id, "worker ready"));

    let handle = Server::new(config, app).start()?;
    tracing::info!("press Ctrl-C to stop");
    handle.wait();
    Ok(())
}
