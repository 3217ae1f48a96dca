//! Error types for the NetBackup exporter.
//!
//! This module defines custom error types using `thiserror` for structured
//! error handling throughout the application. Transport-level variants carry
//! the URL they failed on so log lines can be traced back to a request.

use std::time::Duration;
use thiserror::Error;

/// Main error type for NetBackup exporter operations.
#[derive(Debug, Error)]
pub enum NbuError {
    /// Network-level failure (DNS, connect, TLS, timeout)
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success HTTP status that is not a version signal
    #[error("unexpected HTTP status {status} from {url} (content-type: {content_type})")]
    HttpStatus {
        status: u16,
        url: String,
        content_type: String,
    },

    /// Server answered 406 for the requested API version
    #[error("API version {version} is not supported by the server ({url})")]
    UnsupportedVersion { version: String, url: String },

    /// Response body is not JSON
    #[error("unexpected content-type {content_type:?} from {url}; body preview: {preview}")]
    UnexpectedContentType {
        url: String,
        content_type: String,
        preview: String,
    },

    /// JSON body could not be decoded into the expected shape
    #[error("failed to decode response from {url}: {source}; body preview: {preview}")]
    Decode {
        url: String,
        preview: String,
        #[source]
        source: serde_json::Error,
    },

    /// Every candidate API version was rejected
    #[error(
        "no compatible API version found (attempted: {}); verify the NetBackup server version, \
         network connectivity to the primary server and that the API key is valid",
        attempted.join(", ")
    )]
    NoCompatibleVersion { attempted: Vec<String> },

    /// Server rejected the API key
    #[error("authentication failed against {url} (API version {version}); check the configured API key")]
    Authentication { url: String, version: String },

    /// Server kept returning pages beyond the bound derived from its own cursor
    #[error("pagination did not terminate after {pages} pages")]
    PaginationOverrun { pages: usize },

    /// Collection cycle ran out of time
    #[error("collection deadline of {budget:?} exceeded")]
    Deadline { budget: Duration },

    /// Client no longer accepts requests
    #[error("API client is closed")]
    Closed,

    /// Close was called on a client that is already closed
    #[error("API client is already closed")]
    AlreadyClosed,

    /// Requests were still running when the shutdown wait expired
    #[error("shutdown timed out with {in_flight} request(s) still in flight")]
    ShutdownTimeout { in_flight: usize },

    /// Caller cancelled the shutdown wait
    #[error("shutdown wait was cancelled")]
    ShutdownCancelled,

    /// Both storage and job collection failed in the same cycle
    #[error("collection failed: storage: {storage}; jobs: {jobs}")]
    Collection { storage: String, jobs: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid URL built from configuration
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Metrics error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// HTTP server error
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NbuError {
    /// Whether the error is transient and the request may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            NbuError::Transport { .. } => true,
            NbuError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Whether the error is a credential problem rather than a version or
    /// connectivity problem.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            NbuError::Authentication { .. } | NbuError::HttpStatus { status: 401, .. }
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            NbuError::HttpStatus { status, .. } => Some(*status),
            NbuError::UnsupportedVersion { .. } => Some(406),
            _ => None,
        }
    }
}

/// Result type alias for exporter operations.
pub type Result<T> = std::result::Result<T, NbuError>;
