//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Registry HTTP traffic per endpoint
//! - Blob copy outcomes and bytes moved
//! - Manifest pushes
//! - Retry behavior
//! - Execution lifecycle
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.

use crate::execution::ExecutionStatus;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one outbound registry request and its status code.
pub fn record_http_request(endpoint: &str, method: &str, status: u16) {
    counter!(
        "replication_http_requests_total",
        "endpoint" => endpoint.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a retry of an operation (attempt number is 1-indexed).
pub fn record_retry(operation: &str, attempt: usize) {
    counter!("replication_retries_total", "operation" => operation.to_string()).increment(1);
    histogram!("replication_retry_attempt", "operation" => operation.to_string())
        .record(attempt as f64);
}

/// Record a blob streamed to the target.
pub fn record_blob_copied(rule: &str, bytes: u64) {
    counter!("replication_blobs_copied_total", "rule" => rule.to_string()).increment(1);
    counter!("replication_bytes_synced_total", "rule" => rule.to_string()).increment(bytes);
}

/// Record a blob that was already present on the target.
pub fn record_blob_skipped(rule: &str) {
    counter!("replication_blobs_skipped_total", "rule" => rule.to_string()).increment(1);
}

/// Record a blob satisfied by a cross-repo mount.
pub fn record_blob_mounted(rule: &str) {
    counter!("replication_blobs_mounted_total", "rule" => rule.to_string()).increment(1);
}

/// Record a blob that failed after retries.
pub fn record_blob_failed(rule: &str) {
    counter!("replication_blobs_failed_total", "rule" => rule.to_string()).increment(1);
}

/// Record a manifest pushed to an endpoint.
pub fn record_manifest_pushed(endpoint: &str) {
    counter!("replication_manifests_pushed_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Record a manifest push failure for a rule.
pub fn record_manifest_push_failed(rule: &str) {
    counter!("replication_manifest_push_failures_total", "rule" => rule.to_string()).increment(1);
}

/// Record the size of a planned blob set.
pub fn record_plan(rule: &str, tags: usize, blobs: usize) {
    histogram!("replication_plan_tags", "rule" => rule.to_string()).record(tags as f64);
    histogram!("replication_plan_blobs", "rule" => rule.to_string()).record(blobs as f64);
}

/// Record an execution start.
pub fn record_execution_started(rule: &str) {
    counter!("replication_executions_started_total", "rule" => rule.to_string()).increment(1);
}

/// Record a finished execution with its terminal status and duration.
pub fn record_execution_finished(rule: &str, status: ExecutionStatus, duration: Duration) {
    counter!(
        "replication_executions_finished_total",
        "rule" => rule.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("replication_execution_duration_seconds", "rule" => rule.to_string())
        .record(duration.as_secs_f64());
}

/// Gauge for the number of executions currently running.
pub fn set_running_executions(count: usize) {
    gauge!("replication_running_executions").set(count as f64);
}
