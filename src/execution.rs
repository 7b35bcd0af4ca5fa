// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Execution records and progress counters.
//!
//! An [`Execution`] is one concrete run of a [`ReplicationRule`]. The
//! scheduler creates it, the engine drives the counters, and the scheduler
//! writes the terminal state exactly once.
//!
//! # State Machine
//!
//! ```text
//!   pending ──(start)──▶ running ──(ok)──▶ success
//!                           │
//!                           ├──(err)────▶ failed
//!                           └──(cancel)─▶ canceled
//! ```
//!
//! `success`, `failed` and `canceled` are terminal; [`Execution::finish`]
//! is a no-op once a terminal state has been written.
//!
//! # Counters
//!
//! Workers update [`ExecutionCounters`] through atomics while the blob
//! pool is draining; consumers only ever see monotonically non-decreasing
//! snapshots, and `synced + failed <= total` holds at every instant.
//! `synced` counts blobs confirmed present on the target, which includes
//! the skipped ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created but not yet started.
    Pending,
    /// The engine is working on it.
    Running,
    /// Finished with zero failures.
    Success,
    /// Finished with at least one failed blob/tag, or aborted in preflight.
    Failed,
    /// Stopped on request before completion.
    Canceled,
}

impl ExecutionStatus {
    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Log severity for execution log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an execution's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub execution_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(execution_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Immutable snapshot of the progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Blobs in the plan.
    pub total_blobs: u64,
    /// Blobs confirmed present on the target (copied, mounted, or skipped).
    pub synced_blobs: u64,
    /// Blobs that were already on the target.
    pub skipped_blobs: u64,
    /// Blobs that failed after retries.
    pub failed_blobs: u64,
    /// Bytes actually transferred.
    pub bytes_synced: u64,
}

/// Shared atomic counters updated by blob copy workers.
#[derive(Debug, Default)]
pub struct ExecutionCounters {
    total: AtomicU64,
    synced: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

impl ExecutionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the plan size. Called once, before the blob phase.
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Blob was already on the target.
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.synced.fetch_add(1, Ordering::Relaxed);
    }

    /// Blob arrived via cross-repo mount (no bytes moved).
    pub fn record_mounted(&self) {
        self.synced.fetch_add(1, Ordering::Relaxed);
    }

    /// Blob was streamed to the target.
    pub fn record_copied(&self, bytes: u64) {
        self.synced.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Blob failed after retries.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Current counter values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_blobs: self.total.load(Ordering::Relaxed),
            synced_blobs: self.synced.load(Ordering::Relaxed),
            skipped_blobs: self.skipped.load(Ordering::Relaxed),
            failed_blobs: self.failed.load(Ordering::Relaxed),
            bytes_synced: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// One run of a replication rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique execution id.
    pub id: String,
    /// Name of the rule this run belongs to.
    pub rule: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Final (or latest persisted) counter values.
    pub counters: CounterSnapshot,
    /// Aggregated error summary, set on `failed`.
    pub error: Option<String>,
}

impl Execution {
    /// Create a pending execution for a rule.
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule: rule.into(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            counters: CounterSnapshot::default(),
            error: None,
        }
    }

    /// Transition to `running` and stamp the start time.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Utc::now();
    }

    /// Write the terminal state. No-op if already terminal.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        debug_assert!(status.is_terminal(), "finish() takes a terminal status");
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.error = error;
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, up to now for running executions.
    pub fn duration(&self) -> chrono::Duration {
        match self.finished_at {
            Some(end) => end - self.started_at,
            None => Utc::now() - self.started_at,
        }
    }

    /// Percentage of planned blobs confirmed on the target.
    pub fn progress(&self) -> f64 {
        if self.counters.total_blobs == 0 {
            return 0.0;
        }
        self.counters.synced_blobs as f64 / self.counters.total_blobs as f64 * 100.0
    }
}
