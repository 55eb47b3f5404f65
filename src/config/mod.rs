//! Server configuration.
//!
//! [`ServerConfig`] is read from TOML; every field has a default, so an empty
//! file is a valid configuration:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8080
//! workers = 4
//! backend = "prefork"        # or "dispatch"
//! body_buffer_limit = 1048576
//! max_request_size = 8388608
//! keep_alive = true
//! request_timeout_secs = 30
//! ```

use std::{
    fs,
    net::SocketAddr,
    num::NonZeroUsize,
    path::Path,
    thread,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid listen address {0}")]
    Address(String),

    #[error("{0}")]
    Invalid(&'static str),
}

/// Which socket backend serves connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One listener per worker thread, all bound to the same port.
    #[default]
    Prefork,
    /// One acceptor handing connections to worker threads.
    Dispatch,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prefork => "prefork",
            Self::Dispatch => "dispatch",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Worker threads; `0` means one per available CPU.
    pub workers: usize,
    pub backend: BackendKind,
    /// Bodies up to this size are buffered and parsed; larger ones are streamed.
    pub body_buffer_limit: usize,
    /// Requests whose head or declared body exceed this are rejected with 413.
    /// Heads are additionally capped at 64 KiB.
    pub max_request_size: usize,
    pub keep_alive: bool,
    /// Per-request deadline for the middleware chain; unset means none.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            workers: 0,
            backend: BackendKind::Prefork,
            body_buffer_limit: 1024 * 1024,
            max_request_size: 8 * 1024 * 1024,
            keep_alive: true,
            request_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.addr()?;
        if self.max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be positive"));
        }
        if self.body_buffer_limit > self.max_request_size {
            return Err(ConfigError::Invalid(
                "body_buffer_limit must not exceed max_request_size",
            ));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::Address(addr))
    }

    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
