//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change feed polling
//! - Revision transfer (pulled, pushed, failed)
//! - Checkpoint saves
//! - Remote request latency and retries
//! - Replication status and outstanding work
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Per-replication metrics carry a `session_id` label (`repl001`, ...).
//!
//! # Usage
//!
//! ```rust,no_run
//! use couch_replicator::metrics;
//! use std::time::Duration;
//!
//! // After the change tracker hands over a poll response
//! metrics::record_changes_received("repl001", 42);
//!
//! // After an insert transaction
//! metrics::record_insert_batch("repl001", 40, 2, Duration::from_millis(15));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Change Feed Metrics
// =============================================================================

/// Record changes received from the remote `_changes` feed.
pub fn record_changes_received(session_id: &str, count: usize) {
    counter!("replication_changes_received_total", "session_id" => session_id.to_string())
        .increment(count as u64);
}

/// Record one change feed poll and its outcome.
pub fn record_change_feed_poll(session_id: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_change_feed_polls_total",
        "session_id" => session_id.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replication_change_feed_poll_duration_seconds", "session_id" => session_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a backoff sleep after a failed poll.
pub fn record_change_feed_backoff(session_id: &str, delay: Duration) {
    histogram!("replication_change_feed_backoff_seconds", "session_id" => session_id.to_string())
        .record(delay.as_secs_f64());
}

/// Record a change dropped because it could not be parsed or named an invalid document.
pub fn record_change_rejected(session_id: &str) {
    counter!("replication_changes_rejected_total", "session_id" => session_id.to_string()).increment(1);
}

// =============================================================================
// Revision Transfer Metrics
// =============================================================================

/// Record revisions inserted locally from the remote.
pub fn record_revisions_pulled(session_id: &str, count: usize) {
    counter!("replication_revisions_pulled_total", "session_id" => session_id.to_string())
        .increment(count as u64);
}

/// Record revisions accepted by the remote.
pub fn record_revisions_pushed(session_id: &str, count: usize) {
    counter!("replication_revisions_pushed_total", "session_id" => session_id.to_string())
        .increment(count as u64);
}

/// Record a revision that failed to transfer.
pub fn record_revision_failed(session_id: &str, direction: &str) {
    counter!(
        "replication_revisions_failed_total",
        "session_id" => session_id.to_string(),
        "direction" => direction.to_string()
    )
    .increment(1);
}

/// Record a revision the remote rejected with 403 (validation, not a failure).
pub fn record_revision_rejected(session_id: &str) {
    counter!("replication_revisions_rejected_total", "session_id" => session_id.to_string()).increment(1);
}

/// Record a pulled-revision insert transaction.
pub fn record_insert_batch(session_id: &str, inserted: usize, failed: usize, duration: Duration) {
    let session = session_id.to_string();
    histogram!("replication_insert_batch_size", "session_id" => session.clone()).record(inserted as f64);
    histogram!("replication_insert_batch_duration_seconds", "session_id" => session.clone())
        .record(duration.as_secs_f64());
    if failed > 0 {
        counter!("replication_insert_failures_total", "session_id" => session).increment(failed as u64);
    }
}

/// Record a `_bulk_get` or `_all_docs` fetch.
pub fn record_bulk_fetch(session_id: &str, method: &str, requested: usize, received: usize) {
    let session = session_id.to_string();
    counter!(
        "replication_bulk_fetches_total",
        "session_id" => session.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    histogram!("replication_bulk_fetch_size", "session_id" => session.clone()).record(requested as f64);
    if received < requested {
        counter!("replication_bulk_fetch_shortfall_total", "session_id" => session)
            .increment((requested - received) as u64);
    }
}

/// Record a permanent fallback from multipart to JSON uploads.
pub fn record_multipart_fallback(session_id: &str) {
    counter!("replication_multipart_fallbacks_total", "session_id" => session_id.to_string()).increment(1);
}

// =============================================================================
// Checkpoint Metrics
// =============================================================================

/// Record a remote checkpoint save.
pub fn record_checkpoint_save(session_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_checkpoint_saves_total",
        "session_id" => session_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a checkpoint conflict that forced a refresh of the remote document.
pub fn record_checkpoint_conflict(session_id: &str) {
    counter!("replication_checkpoint_conflicts_total", "session_id" => session_id.to_string()).increment(1);
}

// =============================================================================
// Remote Request Metrics
// =============================================================================

/// Record a remote request's latency by operation and outcome.
pub fn record_request(operation: &str, status: u16, duration: Duration) {
    histogram!(
        "replication_request_duration_seconds",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a retry of a transient request failure.
pub fn record_request_retry(operation: &str) {
    counter!("replication_request_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a request cancelled by stop or go-offline.
pub fn record_request_cancelled(operation: &str) {
    counter!("replication_requests_cancelled_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Replication State Metrics
// =============================================================================

/// Gauge for outstanding async tasks.
pub fn set_active_tasks(session_id: &str, count: usize) {
    gauge!("replication_active_tasks", "session_id" => session_id.to_string()).set(count as f64);
}

/// Gauge for revisions awaiting download.
pub fn set_pending_downloads(session_id: &str, count: usize) {
    gauge!("replication_pending_downloads", "session_id" => session_id.to_string()).set(count as f64);
}

/// Gauge for replication status.
pub fn set_replication_status(session_id: &str, status: &str) {
    // Encode status as numeric for alerting
    let value = match status {
        "Stopped" => 0.0,
        "Offline" => 1.0,
        "Idle" => 2.0,
        "Active" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_status", "session_id" => session_id.to_string()).set(value);
}

/// Record an error surfaced as the replication's last error.
pub fn record_error(session_id: &str, error_type: &str) {
    counter!(
        "replication_errors_total",
        "session_id" => session_id.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}
