//! Typed failures with a well-defined HTTP rendering.
//!
//! Middleware and handlers return [`HttpError`] through the `?` operator; the
//! [`Kernel`](crate::kernel::Kernel) maps every variant to a response with
//! [`HttpError::into_response`], so no error ever reaches a backend adapter.

use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::{Response, StatusCode};

/// Failures raised inside the request pipeline.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The double-submit CSRF check failed.
    #[error("CSRF token is invalid")]
    TokenMismatch,

    /// A handler asked for the session but no upstream stage attached one.
    #[error("Session is not started")]
    SessionNotStarted,

    #[error("File does not exist: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("range offset {offset} length {length:?} exceeds file size {size}")]
    RangeNotSatisfiable {
        offset: u64,
        length: Option<u64>,
        size: u64,
    },

    #[error("invalid status code {0}")]
    InvalidStatus(u16),

    #[error("{0} is not a redirection status")]
    InvalidRedirect(StatusCode),

    #[error("unsupported HTTP version {0}")]
    UnsupportedVersion(String),

    /// The raw request body stream was already taken by an earlier reader.
    #[error("request body has already been consumed")]
    BodyConsumed,

    #[error("failed to read request body: {0}")]
    Body(#[from] io::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The per-request deadline expired before the chain produced a response.
    #[error("request deadline exceeded")]
    Timeout,

    /// A handler explicitly aborted with a status and message.
    #[error("{message}")]
    Abort { status: StatusCode, message: String },
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    status: u16,
    message: &'a str,
}

impl HttpError {
    /// Aborts the request with an arbitrary status and message.
    pub fn abort(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Abort {
            status,
            message: message.into(),
        }
    }

    /// The status code this failure renders with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TokenMismatch => StatusCode::PageExpired,
            Self::FileNotFound { .. } => StatusCode::NotFound,
            Self::RangeNotSatisfiable { .. } => StatusCode::RangeNotSatisfiable,
            Self::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            Self::Body(_) => StatusCode::BadRequest,
            Self::Timeout => StatusCode::ServiceUnavailable,
            Self::Abort { status, .. } => *status,
            Self::SessionNotStarted
            | Self::InvalidStatus(_)
            | Self::InvalidRedirect(_)
            | Self::BodyConsumed
            | Self::Json(_) => StatusCode::InternalServerError,
        }
    }

    /// Renders the failure as a JSON response: `{"status":419,"message":"..."}`.
    pub fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let payload = ErrorPayload {
            status: status.as_u16(),
            message: &message,
        };
        match Response::json(&payload) {
            Ok(response) => response.with_status(status),
            Err(_) => Response::new(status).with_body(message),
        }
    }
}
