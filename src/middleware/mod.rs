//! Middleware pipeline — composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`Handler`] — the final stage, usually a router supplied by the application.
//! - [`from_fn`] — wraps a closure as a middleware stage.
//! - [`LoggerMiddleware`] — built-in request/response logger.
//!
//! Stages run in configuration order on the way in and in reverse order on
//! the way out. The chain itself lives in the [`Kernel`](crate::kernel::Kernel).

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::http::{HttpError, Request, Response};

/// What every stage produces: a response, or a typed failure the kernel renders.
pub type Outcome = Result<Response, HttpError>;

/// A boxed, `Send` future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the final [`Handler`] once every middleware has run.
///
/// `Next` is neither `Clone` nor `Copy` and [`run`](Self::run) takes it by
/// value, so a stage cannot invoke the rest of the chain twice:
///
/// ```compile_fail
/// use tandem::http::Request;
/// use tandem::middleware::{BoxFuture, Middleware, Next, Outcome};
///
/// struct Twice;
///
/// impl Middleware for Twice {
///     fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
///         Box::pin(async move {
///             let _ = next.run(request.clone()).await;
///             next.run(request).await
///         })
///     }
/// }
/// ```
pub struct Next<'a> {
    stages: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
    // Position of the stage the next `run` call invokes.
    index: usize,
}

impl<'a> Next<'a> {
    /// Creates a cursor positioned before the first stage.
    pub(crate) fn new(stages: &'a [Arc<dyn Middleware>], handler: &'a dyn Handler) -> Self {
        Self {
            stages,
            handler,
            index: 0,
        }
    }

    /// Invokes the next stage in the chain and returns its outcome.
    ///
    /// # Arguments
    ///
    /// - `request` — the request to hand to the next stage; pass a value from
    ///   [`Request::with_attribute`] to forward a decorated request.
    pub fn run(self, request: Request) -> BoxFuture<'a, Outcome> {
        match self.stages.get(self.index) {
            Some(stage) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                stage.handle(request, next)
            }
            None => self.handler.call(request),
        }
    }

    /// Number of middleware stages that have not run yet.
    pub fn remaining(&self) -> usize {
        self.stages.len() - self.index
    }
}

/// The core trait for all middleware.
///
/// Implementors receive the [`Request`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — return `next.run(request).await`.
/// - **Short-circuit** — return a [`Response`] (or an [`HttpError`]) without
///   calling `next`.
/// - **Decorate** — await `next.run(request)`, then return a transformed copy
///   of the response.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because one chain serves every
///   worker.
/// - Middleware is built once at startup and is stateless across requests
///   unless it holds explicit configuration.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next stage.
    fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The innermost stage: turns a request into a response.
///
/// Any `Fn(Request) -> impl Future<Output = Outcome>` that is `Send + Sync`
/// implements this trait, so a router's dispatch function or a plain closure
/// can be used directly.
pub trait Handler: Send + Sync {
    fn call(&self, request: Request) -> BoxFuture<'_, Outcome>;
}

impl<T, F> Handler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Outcome> + Send + 'static,
{
    fn call(&self, request: Request) -> BoxFuture<'_, Outcome> {
        Box::pin((self)(request))
    }
}

/// Middleware built from a closure by [`from_fn`].
pub struct FromFn<F> {
    f: F,
}

/// Wraps a closure as a middleware stage.
///
/// ```rust
/// use tandem::middleware::from_fn;
///
/// let stamp = from_fn(|request, next| {
///     Box::pin(async move {
///         let outcome = next.run(request).await;
///         outcome.map(|response| response.with_header("X-Served-By", "tandem"))
///     })
/// });
/// # let _ = stamp;
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(Request, Next<'a>) -> BoxFuture<'a, Outcome> + Send + Sync,
{
    FromFn { f }
}

impl<F> Middleware for FromFn<F>
where
    F: for<'a> Fn(Request, Next<'a>) -> BoxFuture<'a, Outcome> + Send + Sync,
{
    fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        (self.f)(request, next)
    }

    fn name(&self) -> &'static str {
        "from_fn"
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the downstream stages complete.
/// Typed failures are logged with the status they will be rendered with.
/// `LoggerMiddleware` never short-circuits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().clone();
            let path = request.path().to_owned();

            let outcome = next.run(request).await;

            let status = match &outcome {
                Ok(response) => response.status(),
                Err(err) => err.status(),
            };
            tracing::info!(
                %method,
                %path,
                status = status.as_u16(),
                elapsed = ?start.elapsed(),
                "request handled"
            );

            outcome
        })
    }

    fn name(&self) -> &'static str {
        "logger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::StatusCode;
    use std::sync::Mutex;

    type Trace = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        trace: Trace,
    }

    impl Middleware for Recorder {
        fn handle<'a>(&'a self, request: Request, next: Next<'a>) -> BoxFuture<'a, Outcome> {
            Box::pin(async move {
                self.trace.lock().unwrap().push(format!("enter {}", self.label));
                let outcome = next.run(request).await;
                self.trace.lock().unwrap().push(format!("exit {}", self.label));
                outcome
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle<'a>(&'a self, _request: Request, _next: Next<'a>) -> BoxFuture<'a, Outcome> {
            Box::pin(async { Err(HttpError::abort(StatusCode::Forbidden, "denied")) })
        }
    }

    #[tokio::test]
    async fn stages_enter_in_order_and_unwind_in_reverse() {
        let trace: Trace = Arc::default();
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder { label: "a", trace: trace.clone() }),
            Arc::new(Recorder { label: "b", trace: trace.clone() }),
        ];
        let handler_trace = trace.clone();
        let handler = move |_req: Request| {
            let trace = handler_trace.clone();
            async move {
                trace.lock().unwrap().push("handler".to_owned());
                Ok(Response::new(StatusCode::Ok))
            }
        };

        let next = Next::new(&stages, &handler);
        assert_eq!(next.remaining(), 2);
        let response = next.run(Request::builder().build()).await.unwrap();

        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(
            *trace.lock().unwrap(),
            vec!["enter a", "enter b", "handler", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_rest() {
        let trace: Trace = Arc::default();
        let stages: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder { label: "outer", trace: trace.clone() }),
            Arc::new(Deny),
            Arc::new(Recorder { label: "inner", trace: trace.clone() }),
        ];
        let handler = |_req: Request| async { Ok(Response::new(StatusCode::Ok)) };

        let outcome = Next::new(&stages, &handler)
            .run(Request::builder().build())
            .await;

        assert_eq!(outcome.unwrap_err().status(), StatusCode::Forbidden);
        assert_eq!(*trace.lock().unwrap(), vec!["enter outer", "exit outer"]);
    }

    #[tokio::test]
    async fn closure_stage_decorates_response() {
        let stages: Vec<Arc<dyn Middleware>> = vec![Arc::new(from_fn(|request, next| {
            Box::pin(async move {
                let outcome = next.run(request).await;
                outcome.map(|response| response.with_header("X-Stage", "closure"))
            })
        }))];
        let handler = |_req: Request| async { Ok(Response::new(StatusCode::Ok)) };

        let response = Next::new(&stages, &handler)
            .run(Request::builder().build())
            .await
            .unwrap();
        assert_eq!(response.headers().get("x-stage"), Some("closure"));
        assert_eq!(stages[0].name(), "from_fn");
    }

    #[tokio::test]
    async fn logger_passes_outcome_through() {
        let stages: Vec<Arc<dyn Middleware>> = vec![Arc::new(LoggerMiddleware)];
        let handler = |_req: Request| async { Ok(Response::new(StatusCode::Created)) };
        let response = Next::new(&stages, &handler)
            .run(Request::builder().build())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(LoggerMiddleware.name(), "logger");
    }
}
