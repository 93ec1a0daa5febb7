//! Error types for the service driver.
//!
//! # Design
//! `DriverError` is the closed taxonomy every failed call is classified into
//! before it becomes an envelope. The explicit kinds (`Timeout`, `Network`,
//! `Redirect`, `MalformedResponse`, `Authentication`, `Tls`, `Http`) carry a
//! synthetic status of their own. `Message` is an ordinary error with only a
//! message to go on, and `Opaque` stands for a failure value that is not an
//! error at all.
//!
//! `TransportError` is what a backend reports when the HTTP exchange itself
//! failed: an optional machine code, the message, and the response if the
//! server produced one. `ConfigError` covers programmer mistakes and is the
//! only error that escapes the driver instead of being enveloped.

use serde_json::Value;
use thiserror::Error;

use crate::wrapped::{RequestConfig, TransportResponse};

/// Codes a transport uses to report a cancelled request.
pub const CANCELED_CODES: &[&str] = &["ERR_CANCELED", "ABORT_ERR"];
/// Codes a transport uses to report a timed-out request.
pub const TIMEOUT_CODES: &[&str] = &["ECONNABORTED", "ETIMEDOUT"];

/// Classified failure of a service call.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Network(String),

    #[error("{0}")]
    Redirect(String),

    #[error("{0}")]
    MalformedResponse(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Tls(String),

    /// Generic HTTP failure with a caller-chosen status.
    #[error("{message}")]
    Http {
        status: Option<u16>,
        message: String,
        data: Option<Value>,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An error known only by its message.
    #[error("{0}")]
    Message(String),

    /// A failure value that carries no error semantics.
    #[error("{0}")]
    Opaque(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DriverError {
    pub fn timeout() -> Self {
        Self::Timeout("timeout".to_string())
    }

    pub fn network() -> Self {
        Self::Network("Network error occurred".to_string())
    }

    pub fn redirect() -> Self {
        Self::Redirect("Maximum redirects exceeded".to_string())
    }

    pub fn malformed() -> Self {
        Self::MalformedResponse("Malformed response".to_string())
    }

    pub fn authentication() -> Self {
        Self::Authentication("Authentication failed".to_string())
    }

    pub fn tls() -> Self {
        Self::Tls("TLS/SSL error occurred".to_string())
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Synthetic status of an explicit kind; `None` for the generic ones.
    pub fn synthetic_status(&self) -> Option<u16> {
        match self {
            Self::Timeout(_) => Some(408),
            Self::Network(_) => Some(503),
            Self::Redirect(_) => Some(310),
            Self::MalformedResponse(_) => Some(500),
            Self::Authentication(_) => Some(401),
            Self::Tls(_) => Some(525),
            Self::Http { status, .. } => Some(status.unwrap_or(500)),
            _ => None,
        }
    }
}

/// Failure reported by a transport backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: Option<String>,
    pub message: String,
    /// Response received before the failure, if any.
    pub response: Option<TransportResponse>,
    /// The request that failed, so an error interceptor can replay it.
    pub config: Option<RequestConfig>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            response: None,
            config: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_response(mut self, response: TransportResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = Some(config);
        self
    }

    fn has_code(&self, codes: &[&str]) -> bool {
        self.code
            .as_deref()
            .map(|code| {
                let upper = code.to_ascii_uppercase();
                codes.iter().any(|c| upper.contains(c))
            })
            .unwrap_or(false)
    }

    pub fn is_canceled(&self) -> bool {
        self.has_code(CANCELED_CODES)
    }

    pub fn is_timeout(&self) -> bool {
        self.has_code(TIMEOUT_CODES)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(format!("timeout: {e}")).with_code("ETIMEDOUT")
        } else if e.is_connect() || e.is_request() {
            Self::new(format!("network error: {e}")).with_code("ERR_NETWORK")
        } else if e.is_decode() || e.is_body() {
            Self::new(e.to_string()).with_code("ERR_BAD_RESPONSE")
        } else {
            Self::new(e.to_string())
        }
    }
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.into())
    }
}

/// Invalid driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Missing required configuration values")]
    MissingConfiguration,

    #[error("Custom version position requires a template. Please provide a template in versionConfig.")]
    MissingVersionTemplate,

    #[error("invalid service registry: {0}")]
    InvalidRegistry(String),

    #[error("failed to build transport: {0}")]
    Transport(String),
}
