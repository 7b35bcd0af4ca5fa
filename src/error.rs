// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by their source (transport, registry protocol,
//! scheduling, etc.) and include context to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Network` | Sometimes | Transport errors; timeouts and connect failures retry |
//! | `Http` | Sometimes | Status-bearing registry errors; 429/5xx retry |
//! | `Protocol` | No | Malformed manifest JSON, missing digest/Location header |
//! | `Config` | No | Invalid rule, endpoint, or filter configuration |
//! | `NotFound` | No | Unknown rule, endpoint, or execution |
//! | `Conflict` | No | Rule already has an execution in flight |
//! | `RetriesExhausted` | No | Operation kept failing after the final attempt |
//! | `Pool` | No | One or more worker-pool tasks failed |
//! | `Incomplete` | No | Execution finished with failed blobs or tags |
//! | `Store` | No | Persistence layer failure (needs operator attention) |
//! | `Canceled` | No | Execution context was canceled |
//! | `InvalidState` | No | Lifecycle violation (bug in the caller) |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. The registry client itself never
//! retries; the retry loop in [`crate::resilience`] owns that. Unknown
//! errors are classified as non-retryable (fail closed).

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// HTTP status codes that warrant a retry.
///
/// 429 (throttled) and the transient 5xx family. Everything else in the
/// 4xx range is a terminal protocol-level answer.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors that can occur during replication.
///
/// Each variant includes context about where the error occurred.
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transport-level failure talking to a registry.
    ///
    /// Timeouts and connection failures are retryable; everything else
    /// (TLS setup, malformed URLs, decode failures) is not.
    #[error("network error ({operation}): {source}")]
    Network {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    /// The registry answered with an unexpected HTTP status.
    ///
    /// The response body (truncated) is carried for diagnostics.
    #[error("registry returned status {status} ({operation}): {body}")]
    Http {
        operation: String,
        status: u16,
        body: String,
    },

    /// The registry spoke, but not the v2 protocol we expected.
    ///
    /// Missing `Location`/`Docker-Content-Digest` headers, unparseable
    /// manifest JSON, or a token endpoint without a token.
    /// Terminal for the tag being processed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid rule, endpoint, or filter configuration.
    ///
    /// Fix the configuration; nothing transient about it.
    #[error("configuration error: {0}")]
    Config(String),

    /// A referenced rule, endpoint, or execution does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The rule already has an execution in `running` state.
    ///
    /// At most one execution per rule may be in flight.
    #[error("rule {0} already has an execution in flight")]
    Conflict(String),

    /// A retried operation failed on its final attempt.
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        message: String,
    },

    /// One or more tasks in a worker pool failed.
    ///
    /// Individual task errors never cancel the pool; this summarizes what
    /// [`WorkerPool::wait()`](crate::pool::WorkerPool::wait) observed.
    #[error("worker pool encountered {failed} error(s): {first}")]
    Pool { failed: u64, first: String },

    /// The execution ran to the end but some blobs or tags failed.
    ///
    /// The rule-level status is `failed`; individual failures were already
    /// logged on the execution record.
    #[error("execution incomplete: {failed_blobs} blob(s) and {failed_tags} tag(s) failed")]
    Incomplete { failed_blobs: u64, failed_tags: u64 },

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(String),

    /// The execution context was canceled.
    ///
    /// Not a failure; the execution record is marked `canceled`.
    #[error("operation canceled")]
    Canceled,

    /// Lifecycle violation (e.g. waiting on a pool twice).
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error. Indicates a bug worth investigating.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a network error wrapping a transport failure.
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            operation: operation.into(),
            source,
        }
    }

    /// Create an HTTP status error, truncating the body for log hygiene.
    pub fn http(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > 512 {
            body.truncate(512);
        }
        Self::Http {
            operation: operation.into(),
            status,
            body,
        }
    }

    /// Check if this error is worth retrying with backoff.
    ///
    /// Fails closed: anything unrecognized is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source, .. } => is_retryable_transport(source),
            Self::Http { status, .. } => RETRYABLE_STATUS.contains(status),
            _ => false,
        }
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Transport-level retryability.
///
/// `reqwest` does not expose errno-level detail, so connection resets that
/// surface as mid-body failures are matched on the rendered message.
fn is_retryable_transport(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    if err.is_decode() || err.is_builder() {
        return false;
    }
    let msg = err.to_string().to_lowercase();
    ["connection reset", "connection refused", "broken pipe", "unexpected eof"]
        .iter()
        .any(|pattern| msg.contains(pattern))
}
