//! The kernel: owns the middleware chain and turns every request into exactly
//! one response.
//!
//! The chain is assembled once by [`KernelBuilder::build`] and shared by all
//! workers. [`Kernel::handle`] never fails: typed failures raised anywhere in
//! the chain are rendered with [`HttpError::into_response`], and an expired
//! deadline becomes `503 Service Unavailable`.

use std::{fmt, sync::Arc, time::Duration};

use tokio::time::{Instant, timeout_at};

use crate::{
    StatusCode,
    context::Deadline,
    http::{HttpError, Request, Response},
    middleware::{Handler, Middleware, Next, Outcome},
};

/// The request pipeline: ordered middleware stages in front of one handler.
///
/// Cloning is cheap; clones share the same stages and handler.
#[derive(Clone)]
pub struct Kernel {
    stages: Arc<[Arc<dyn Middleware>]>,
    handler: Arc<dyn Handler>,
    timeout: Option<Duration>,
}

impl Kernel {
    /// Starts an empty chain with the default `404` handler.
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    /// Drives `request` through the chain and returns the final response.
    ///
    /// When a timeout is configured a [`Deadline`] attribute is attached
    /// before the first stage runs. An earlier deadline already present on the
    /// request is kept.
    pub async fn handle(&self, request: Request) -> Response {
        let request = match self.timeout {
            Some(timeout) => {
                let configured = Instant::now() + timeout;
                match request.attribute::<Deadline>() {
                    Some(existing) if existing.instant() <= configured => request,
                    _ => request.with_attribute(Deadline(configured)),
                }
            }
            None => request,
        };
        let deadline = request.attribute::<Deadline>().copied();

        let method = request.method().clone();
        let path = request.path().to_owned();
        let chain = Next::new(&self.stages, self.handler.as_ref()).run(request);

        let outcome = match deadline {
            Some(deadline) => timeout_at(deadline.instant(), chain)
                .await
                .unwrap_or_else(|_| Err(HttpError::Timeout)),
            None => chain.await,
        };

        match outcome {
            Ok(response) => response,
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    tracing::error!(%method, %path, error = %err, "request failed");
                } else {
                    tracing::debug!(%method, %path, error = %err, "request rejected");
                }
                err.into_response()
            }
        }
    }

    /// Number of middleware stages before the handler.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Per-request deadline applied by [`handle`](Self::handle), if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns a kernel sharing this chain with a different deadline.
    #[must_use]
    pub fn with_timeout(&self, timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    /// Names of the configured stages, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("stages", &self.stage_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Collects the ordered stages and the final handler.
#[derive(Default)]
pub struct KernelBuilder {
    stages: Vec<Arc<dyn Middleware>>,
    handler: Option<Arc<dyn Handler>>,
    timeout: Option<Duration>,
}

impl KernelBuilder {
    /// Appends a stage; stages run in the order they are added.
    #[must_use]
    pub fn middleware(mut self, stage: impl Middleware + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Sets the innermost handler, usually the router.
    #[must_use]
    pub fn handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Bounds the time the chain may take for one request.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Freezes the chain. Without a handler every request that passes the
    /// stages is answered with `404 Not Found`.
    pub fn build(self) -> Kernel {
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(not_found) as Arc<dyn Handler>);
        Kernel {
            stages: self.stages.into(),
            handler,
            timeout: self.timeout,
        }
    }
}

async fn not_found(_request: Request) -> Outcome {
    Err(HttpError::abort(StatusCode::NotFound, "Not Found"))
}
