//! Event bus for replication progress.
//!
//! Provides a publish/subscribe channel for [`EngineEvent`]s: counter
//! snapshots as the blob pool drains, and structured log lines as they are
//! appended to the execution record. The management plane binds this to
//! its WebSocket feed; the engine only publishes.
//!
//! Events for one execution are published (and therefore observed by any
//! single subscriber) in order. The buffer is bounded: a subscriber that
//! cannot keep up sees [`tokio::sync::broadcast::error::RecvError::Lagged`]
//! and misses the overwritten events rather than stalling producers.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.publish(EngineEvent::Log {
//!     execution_id: "e-1".into(),
//!     level: LogLevel::Info,
//!     message: "preflight ok".into(),
//!     timestamp: Utc::now(),
//! });
//!
//! while let Ok(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use crate::execution::{CounterSnapshot, LogLevel};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Maximum number of events buffered per subscriber.
const EVENT_BUFFER_SIZE: usize = 256;

/// Which phase of an execution a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    /// Walking manifests and planning the blob set.
    Manifest,
    /// Copying blobs through the worker pool.
    Blob,
    /// All phases done; final counter snapshot.
    Complete,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "manifest",
            Self::Blob => "blob",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event on the progress feed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineEvent {
    /// Counter snapshot for an execution.
    Progress {
        execution_id: String,
        rule: String,
        phase: ProgressPhase,
        counters: CounterSnapshot,
        /// Digest or reference currently being worked on, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        current: Option<String>,
    },
    /// A structured log line appended to the execution record.
    Log {
        execution_id: String,
        level: LogLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// The execution this event belongs to.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Progress { execution_id, .. } | Self::Log { execution_id, .. } => execution_id,
        }
    }
}

/// Multiplexed progress feed.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to the feed. Each subscriber gets its own bounded buffer.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A feed with no subscribers drops it silently.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers on the event bus");
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(execution_id: &str, synced: u64) -> EngineEvent {
        EngineEvent::Progress {
            execution_id: execution_id.to_string(),
            rule: "test-rule".to_string(),
            phase: ProgressPhase::Blob,
            counters: CounterSnapshot {
                total_blobs: 10,
                synced_blobs: synced,
                ..Default::default()
            },
            current: Some("sha256:abc".to_string()),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(progress("e-1", 1));

        match rx.recv().await.unwrap() {
            EngineEvent::Progress { execution_id, counters, .. } => {
                assert_eq!(execution_id, "e-1");
                assert_eq!(counters.synced_blobs, 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_events_in_order_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 1..=5 {
            bus.publish(progress("e-1", i));
        }

        for expect in 1..=5 {
            match rx.recv().await.unwrap() {
                EngineEvent::Progress { counters, .. } => {
                    assert_eq!(counters.synced_blobs, expect);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_consumer_lags_instead_of_blocking() {
        let bus = EventBus::with_capacity(4);
        let mut rx = bus.subscribe();

        // Overflow the buffer without draining.
        for i in 0..32 {
            bus.publish(progress("e-1", i));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                assert!(missed > 0);
            }
            other => panic!("expected Lagged, got {:?}", other),
        }
        // The subscriber recovers and keeps receiving newer events.
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(progress("e-1", 1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_execution_id() {
        let event = progress("e-42", 0);
        assert_eq!(event.execution_id(), "e-42");
    }

    #[test]
    fn test_event_serializes_tagged() {
        let json = serde_json::to_string(&progress("e-1", 2)).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"phase\":\"blob\""));
        assert!(json.contains("\"synced_blobs\":2"));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ProgressPhase::Manifest.to_string(), "manifest");
        assert_eq!(ProgressPhase::Blob.to_string(), "blob");
        assert_eq!(ProgressPhase::Complete.to_string(), "complete");
    }
}
