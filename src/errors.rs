//! Error categorization for request outcomes and sweep-level failures.
//!
//! Two very different kinds of failure live here:
//!
//! - [`ErrorKind`] classifies a single request that did not succeed. It is
//!   data: it travels inside a `RequestOutcome`, feeds the error taxonomy and
//!   never aborts anything.
//! - [`FatalError`] is a real Rust error. It is raised only when the engine
//!   cannot do its job at all (malformed profile substitution, client
//!   construction failure, unusable prompt source) and aborts the sweep.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::config::ConfigError;
use crate::extractor::ExtractionError;
use crate::prompts::PromptSourceError;
use crate::template::TemplateError;

/// Categories of per-request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request did not complete within its timeout
    Timeout,

    /// DNS, connect, reset or body-transfer failures
    Connection,

    /// HTTP 429 or another status configured as rate limiting
    RateLimited,

    /// HTTP 5xx
    ServerError,

    /// HTTP 4xx (other than rate limiting) and unexpected non-2xx statuses
    ClientError,

    /// A 2xx response whose body could not be interpreted
    MalformedResponse,
}

impl ErrorKind {
    /// Categorize an HTTP status code.
    ///
    /// Returns None for 2xx. `rate_limit_statuses` lists the statuses that
    /// count as rate limiting for the target API (usually just 429).
    pub fn from_status_code(status_code: u16, rate_limit_statuses: &[u16]) -> Option<Self> {
        if rate_limit_statuses.contains(&status_code) {
            return Some(ErrorKind::RateLimited);
        }
        match status_code {
            200..=299 => None,
            500..=599 => Some(ErrorKind::ServerError),
            _ => Some(ErrorKind::ClientError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_decode() {
            ErrorKind::MalformedResponse
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ErrorKind::Connection
        } else {
            let error_msg = error.to_string().to_lowercase();
            if error_msg.contains("timed out") || error_msg.contains("timeout") {
                ErrorKind::Timeout
            } else {
                ErrorKind::Connection
            }
        }
    }

    /// Whether another attempt may succeed where this one failed.
    ///
    /// Client errors and malformed responses are deterministic for a given
    /// request and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
        )
    }

    /// Get the metric/log label for this error kind.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::ClientError => "client_error",
            ErrorKind::MalformedResponse => "malformed_response",
        }
    }

    /// Get a human-readable description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Request Timeout Errors",
            ErrorKind::Connection => "Network/Connection Errors",
            ErrorKind::RateLimited => "Rate Limited (HTTP 429)",
            ErrorKind::ServerError => "HTTP 5xx Server Errors",
            ErrorKind::ClientError => "HTTP 4xx Client Errors",
            ErrorKind::MalformedResponse => "Malformed Responses",
        }
    }

    /// Get all error kinds in a consistent order.
    pub fn all() -> Vec<ErrorKind> {
        vec![
            ErrorKind::Timeout,
            ErrorKind::Connection,
            ErrorKind::RateLimited,
            ErrorKind::ServerError,
            ErrorKind::ClientError,
            ErrorKind::MalformedResponse,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Conditions that stop a level or the whole sweep.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cannot construct request: {0}")]
    Template(#[from] TemplateError),

    #[error("Invalid token extraction rule: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("Prompt source error: {0}")]
    Prompts(#[from] PromptSourceError),

    #[error("Executor task failed: {0}")]
    Task(String),
}

/// Helper to name common HTTP status codes for display.
pub fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",

        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",

        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",

        _ => "Unknown Status",
    }
}
