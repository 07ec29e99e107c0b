// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they happen (remote HTTP peer, local
//! store, configuration) and carry enough context to be logged once and
//! surfaced through the replication's progress stream.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Http` (500/502/503/504) | Yes | Gateway temporarily unavailable |
//! | `Http` (other) | No | Client errors, auth failures, conflicts |
//! | `Transport` | Yes | Connection refused, reset, timeout |
//! | `Json` | No | Malformed response body |
//! | `Store` | No | Local storage rejected an operation |
//! | `Upstream` | No | Peer violated the replication protocol |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Replication state machine violation |
//! | `Cancelled` | No | Request aborted by stop or go-offline |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether a remote
//! request should be repeated. Checkpoint 404/409 handling is not driven
//! by retryability: those statuses are inspected directly by the
//! checkpoint code via [`ReplicationError::status()`].

use serde_json::Value;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// HTTP-like status codes used across the crate.
pub mod status {
    pub const OK: u16 = 200;
    pub const CREATED: u16 = 201;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const CONFLICT: u16 = 409;
    pub const PRECONDITION_FAILED: u16 = 412;
    pub const UNSUPPORTED_MEDIA_TYPE: u16 = 415;
    pub const INTERNAL_SERVER_ERROR: u16 = 500;
    pub const BAD_GATEWAY: u16 = 502;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const GATEWAY_TIMEOUT: u16 = 504;

    /// Statuses worth repeating a request for.
    pub fn is_transient(code: u16) -> bool {
        matches!(
            code,
            INTERNAL_SERVER_ERROR | BAD_GATEWAY | SERVICE_UNAVAILABLE | GATEWAY_TIMEOUT
        )
    }
}

/// Error reported by the local document store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("store error {status}: {message}")]
pub struct StoreError {
    pub status: u16,
    pub message: String,
}

impl StoreError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(status::NOT_FOUND, message)
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// The remote answered with a status of 300 or above.
    ///
    /// Retryable only for gateway-style 5xx statuses.
    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    /// The request never produced a response.
    ///
    /// Connection refused, reset, DNS failure or timeout. Retryable.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// A response body or document could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The local store rejected an operation.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The peer sent something the protocol does not allow,
    /// e.g. an empty `_revisions` history for a generation above 1.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Replication state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The operation was aborted by `stop()` or `go_offline()`.
    #[error("Request cancelled")]
    Cancelled,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create an HTTP error for `status`.
    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
        }
    }

    /// Create a transport error from a reqwest failure.
    pub fn transport(source: reqwest::Error) -> Self {
        Self::Transport {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => status::is_transient(*status),
            Self::Transport { .. } => true,
            Self::Json(_) => false,
            Self::Store(_) => false,
            Self::Upstream(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Cancelled => false,
            Self::Internal(_) => false,
        }
    }

    /// HTTP-like status describing this error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Http { status, .. } => *status,
            Self::Store(e) => e.status,
            Self::Upstream(_) => status::BAD_GATEWAY,
            Self::Json(_) | Self::Config(_) => status::BAD_REQUEST,
            Self::Transport { .. } => status::GATEWAY_TIMEOUT,
            _ => status::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Transport { .. } => "transport",
            Self::Json(_) => "json",
            Self::Store(_) => "store",
            Self::Upstream(_) => "upstream",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// True if this is an HTTP error with exactly `code`.
    pub fn is_http_status(&self, code: u16) -> bool {
        matches!(self, Self::Http { status, .. } if *status == code)
    }
}

/// Status of one entry in a `_bulk_docs` response array.
///
/// Entries without an `error` field succeeded. Otherwise a numeric
/// `status` of 400 or more wins, then the error name is mapped.
pub fn status_from_bulk_docs_item(item: &Value) -> u16 {
    let Some(error) = item.get("error").and_then(Value::as_str) else {
        return status::OK;
    };
    if let Some(code) = item.get("status").and_then(Value::as_u64) {
        if code >= 400 {
            return u16::try_from(code).unwrap_or(status::BAD_GATEWAY);
        }
    }
    match error {
        "unauthorized" => status::UNAUTHORIZED,
        "forbidden" => status::FORBIDDEN,
        "conflict" => status::CONFLICT,
        _ => status::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_retryable_transport() {
        let err = ReplicationError::transport_msg("connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_is_retryable_gateway_statuses() {
        for code in [500, 502, 503, 504] {
            assert!(ReplicationError::http(code, "down").is_retryable(), "{code}");
        }
    }

    #[test]
    fn test_not_retryable_client_statuses() {
        for code in [400, 401, 403, 404, 409, 415, 501] {
            assert!(!ReplicationError::http(code, "nope").is_retryable(), "{code}");
        }
    }

    #[test]
    fn test_not_retryable_upstream() {
        let err = ReplicationError::Upstream("empty _revisions".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.status(), status::BAD_GATEWAY);
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = ReplicationError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Active".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Active"));
    }

    #[test]
    fn test_not_retryable_cancelled() {
        assert!(!ReplicationError::Cancelled.is_retryable());
    }

    #[test]
    fn test_store_error_status() {
        let err: ReplicationError = StoreError::new(403, "validation").into();
        assert_eq!(err.status(), 403);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ReplicationError::http(404, "missing").kind(), "http");
        assert_eq!(ReplicationError::transport_msg("reset").kind(), "transport");
        assert_eq!(ReplicationError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_is_http_status() {
        let err = ReplicationError::http(409, "conflict");
        assert!(err.is_http_status(409));
        assert!(!err.is_http_status(404));
        assert!(!ReplicationError::Cancelled.is_http_status(409));
    }

    #[test]
    fn test_bulk_docs_item_ok() {
        assert_eq!(status_from_bulk_docs_item(&json!({"id": "a", "rev": "1-x"})), 200);
    }

    #[test]
    fn test_bulk_docs_item_numeric_status_wins() {
        let item = json!({"id": "a", "error": "conflict", "status": 412});
        assert_eq!(status_from_bulk_docs_item(&item), 412);
    }

    #[test]
    fn test_bulk_docs_item_error_names() {
        assert_eq!(status_from_bulk_docs_item(&json!({"error": "unauthorized"})), 401);
        assert_eq!(status_from_bulk_docs_item(&json!({"error": "forbidden"})), 403);
        assert_eq!(status_from_bulk_docs_item(&json!({"error": "conflict"})), 409);
        assert_eq!(status_from_bulk_docs_item(&json!({"error": "boom"})), 502);
    }

    #[test]
    fn test_bulk_docs_item_low_status_ignored() {
        let item = json!({"error": "forbidden", "status": 200});
        assert_eq!(status_from_bulk_docs_item(&item), 403);
    }
}
